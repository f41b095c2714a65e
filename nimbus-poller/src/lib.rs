/**
 * NIMBUS POLLER - Processus autonome de synchronisation d'état
 *
 * RÔLE : Seule source de rafraîchissement de la vérité hyperviseur vers le
 * cache partagé. Trois ticks indépendants (roster lent, états et tâches
 * rapides) ; un tick qui échoue est loggé et le suivant repart de zéro.
 */

pub mod config;
pub mod poller;
