/**
 * NIMBUS SHARED - Contrats communs entre le kernel et le poller
 *
 * RÔLE : Types des documents d'état, événements pub/sub, clients vers les
 * collaborateurs externes (cache partagé, hyperviseur, store des VMs).
 *
 * ARCHITECTURE : Les deux processus (kernel + poller) ne communiquent que
 * via le cache partagé ; tout ce qui transite sur le fil est défini ici.
 */

pub mod cache;
pub mod hypervisor;
pub mod models;
pub mod store;
