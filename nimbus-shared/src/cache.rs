/**
 * CACHE PARTAGÉ - Client du store clé/valeur à TTL + pub/sub
 *
 * RÔLE : Abstraction du cache basse latence qui porte les documents d'état
 * VM (TTL court, auto-réparant) et les canaux d'événements inter-processus.
 *
 * FONCTIONNEMENT :
 * - `RedisCache` : backend réel (SET EX natif, PSUBSCRIBE)
 * - `MemoryCache` : jumeau en mémoire pour les tests, mêmes sémantiques
 *   (expiration TTL à la lecture, pub/sub par broadcast)
 */

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

/// Message reçu sur un canal pub/sub
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Contrat du cache partagé. La livraison pub/sub est éphémère et
/// au-plus-une-fois par processus : un abonné arrivé après coup ne verra
/// jamais un événement déjà publié.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError>;
    /// S'abonne à un pattern de canaux ; les messages arrivent sur le
    /// receiver à partir de maintenant seulement.
    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<broadcast::Receiver<ChannelMessage>, CacheError>;
}

/// Backend Redis : ConnectionManager poolé pour les commandes, connexion
/// pub/sub dédiée par abonnement.
pub struct RedisCache {
    manager: ConnectionManager,
    client: redis::Client,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { manager, client })
    }
}

#[async_trait]
impl StateCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<broadcast::Receiver<ChannelMessage>, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (tx, rx) = broadcast::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                // plus aucun abonné : on arrête la pompe
                if tx.send(ChannelMessage { channel, payload }).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Vrai si `channel` correspond au pattern (suffixe `*` uniquement, comme
/// les patterns que nous utilisons).
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => channel == pattern,
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// Jumeau en mémoire du cache partagé : TTL honoré à la lecture, pub/sub
/// sur broadcast local. Toujours disponible, utilisé par les tests.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
    bus: broadcast::Sender<ChannelMessage>,
}

impl MemoryCache {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(256);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) => {
                if let Some(deadline) = entry.expires_at {
                    if Instant::now() >= deadline {
                        entries.remove(key);
                        return Ok(None);
                    }
                }
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        // pas d'abonné = livraison perdue, comme le vrai pub/sub
        let _ = self.bus.send(ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<broadcast::Receiver<ChannelMessage>, CacheError> {
        let mut all = self.bus.subscribe();
        let (tx, rx) = broadcast::channel(256);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                match all.recv().await {
                    Ok(msg) => {
                        if pattern_matches(&pattern, &msg.channel) && tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("hypervisor:*", "hypervisor:vm-power-change"));
        assert!(pattern_matches("hypervisor:*", "hypervisor:task-change"));
        assert!(!pattern_matches("hypervisor:*", "billing:invoice"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exact:more"));
    }

    #[tokio::test]
    async fn test_memory_cache_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("vm:x:state", "{}", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(cache.get("vm:x:state").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("vm:x:state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_pubsub_no_replay() {
        let cache = MemoryCache::new();

        // publié avant abonnement : jamais livré
        cache.publish("hypervisor:task-change", "early").await.unwrap();

        let mut rx = cache.subscribe_pattern("hypervisor:*").await.unwrap();
        cache.publish("hypervisor:task-change", "late").await.unwrap();
        cache.publish("other:channel", "filtered").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, "late");

        // le message hors pattern n'arrive pas
        let none = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(none.is_err());
    }
}
