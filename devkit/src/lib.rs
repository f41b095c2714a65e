/*!
Stubs de développement et de test pour Nimbus.

Permet de tester le pipeline et le poller sans cluster hyperviseur réel :
le faux hyperviseur journalise chaque appel mutant, fait avancer ses
tâches de façon déterministe et accepte l'injection d'échecs ciblés.
*/

pub mod fake_hypervisor;
pub mod fixtures;

pub use fake_hypervisor::FakeHypervisor;
