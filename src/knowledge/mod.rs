//! Knowledge base — the four entity collections extraction writes into.

pub mod model;

pub use model::{Entity, Fact, Person, Reply, Topic, Trait};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};

use crate::error::KnowledgeError;
use crate::pipeline::types::Category;

/// Handle the response handlers mutate knowledge through.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Insert, or replace the entity with the same id in the same category.
    async fn upsert(&self, entity: Entity) -> Result<(), KnowledgeError>;

    /// Entities of `category` with the given ids; unknown ids are skipped.
    async fn get_by_ids(&self, category: Category, ids: &[String]) -> Result<Vec<Entity>, KnowledgeError>;

    async fn list(&self, category: Category) -> Result<Vec<Entity>, KnowledgeError>;

    /// Look a name up in every category; a candidate detected as one category
    /// may already be stored under another.
    async fn find_by_name_across_categories(
        &self,
        name: &str,
    ) -> Result<Option<(Category, String)>, KnowledgeError>;

    /// Record a generated reply for a subject (`None` = intentional silence).
    async fn record_reply(&self, subject_id: &str, content: Option<String>) -> Result<(), KnowledgeError>;

    /// Entity of `category` whose name matches, if any.
    async fn find_by_name(&self, category: Category, name: &str) -> Result<Option<Entity>, KnowledgeError> {
        Ok(self
            .list(category)
            .await?
            .into_iter()
            .find(|e| e.has_name(name)))
    }

    async fn get(&self, category: Category, id: &str) -> Result<Option<Entity>, KnowledgeError> {
        Ok(self
            .get_by_ids(category, &[id.to_string()])
            .await?
            .into_iter()
            .next())
    }
}

/// Replies kept per subject; older ones are dropped.
const REPLY_LOG_LIMIT: usize = 50;

/// In-memory knowledge base. Entities keep insertion order per category.
pub struct InMemoryKnowledgeBase {
    entities: RwLock<HashMap<Category, Vec<Entity>>>,
    replies: RwLock<HashMap<String, VecDeque<Reply>>>,
    reply_tx: broadcast::Sender<Reply>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Arc<Self> {
        let (reply_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            entities: RwLock::new(HashMap::new()),
            replies: RwLock::new(HashMap::new()),
            reply_tx,
        })
    }

    /// Subscribe to replies as they are recorded.
    pub fn subscribe_replies(&self) -> broadcast::Receiver<Reply> {
        self.reply_tx.subscribe()
    }

    /// The most recent replies recorded for a subject, oldest first.
    pub async fn replies(&self, subject_id: &str) -> Vec<Reply> {
        self.replies
            .read()
            .await
            .get(subject_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entities across all categories.
    pub async fn total(&self) -> usize {
        self.entities.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn upsert(&self, entity: Entity) -> Result<(), KnowledgeError> {
        let blank = if entity.id().trim().is_empty() {
            Some("id is empty")
        } else if entity.name().trim().is_empty() {
            Some("name is empty")
        } else {
            None
        };
        if let Some(reason) = blank {
            return Err(KnowledgeError::InvalidEntity {
                category: entity.category().to_string(),
                reason: reason.to_string(),
            });
        }

        let mut entities = self.entities.write().await;
        let bucket = entities.entry(entity.category()).or_default();
        match bucket.iter_mut().find(|e| e.id() == entity.id()) {
            Some(existing) => *existing = entity,
            None => bucket.push(entity),
        }
        Ok(())
    }

    async fn get_by_ids(&self, category: Category, ids: &[String]) -> Result<Vec<Entity>, KnowledgeError> {
        let entities = self.entities.read().await;
        Ok(entities
            .get(&category)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|e| ids.iter().any(|id| id == e.id()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list(&self, category: Category) -> Result<Vec<Entity>, KnowledgeError> {
        Ok(self
            .entities
            .read()
            .await
            .get(&category)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_by_name_across_categories(
        &self,
        name: &str,
    ) -> Result<Option<(Category, String)>, KnowledgeError> {
        let entities = self.entities.read().await;
        Ok(Category::ALL.iter().find_map(|category| {
            entities
                .get(category)?
                .iter()
                .find(|e| e.has_name(name))
                .map(|e| (*category, e.id().to_string()))
        }))
    }

    async fn record_reply(&self, subject_id: &str, content: Option<String>) -> Result<(), KnowledgeError> {
        let reply = Reply {
            subject_id: subject_id.to_string(),
            content,
            created_at: Utc::now(),
        };
        {
            let mut replies = self.replies.write().await;
            let log = replies.entry(subject_id.to_string()).or_default();
            log.push_back(reply.clone());
            if log.len() > REPLY_LOG_LIMIT {
                log.pop_front();
            }
        }
        // ok if nobody is listening
        let _ = self.reply_tx.send(reply);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(id: &str, name: &str) -> Entity {
        Entity::Fact(Fact {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            sentiment: 0.0,
            confidence: None,
            learned_by: None,
            last_updated: Utc::now(),
        })
    }

    fn topic(id: &str, name: &str) -> Entity {
        Entity::Topic(Topic {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            sentiment: 0.0,
            category: None,
            exposure_current: 0.5,
            exposure_desired: 0.5,
            learned_by: None,
            last_updated: Utc::now(),
        })
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let kb = InMemoryKnowledgeBase::new();
        kb.upsert(fact("f1", "Location")).await.unwrap();
        kb.upsert(fact("f1", "Home city")).await.unwrap();
        let facts = kb.list(Category::Fact).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].name(), "Home city");
    }

    #[tokio::test]
    async fn upsert_rejects_blank_name() {
        let kb = InMemoryKnowledgeBase::new();
        let err = kb.upsert(fact("f1", "  ")).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::InvalidEntity { .. }));
        assert!(err.to_string().contains("name is empty"));
        assert_eq!(kb.total().await, 0);
    }

    #[tokio::test]
    async fn cross_category_lookup() {
        let kb = InMemoryKnowledgeBase::new();
        kb.upsert(fact("f1", "Location")).await.unwrap();
        kb.upsert(topic("t1", "Chess")).await.unwrap();

        let found = kb.find_by_name_across_categories("chess").await.unwrap();
        assert_eq!(found, Some((Category::Topic, "t1".to_string())));
        assert!(kb.find_by_name_across_categories("Go").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_by_ids_skips_unknown() {
        let kb = InMemoryKnowledgeBase::new();
        kb.upsert(fact("f1", "A")).await.unwrap();
        kb.upsert(fact("f2", "B")).await.unwrap();
        let got = kb
            .get_by_ids(Category::Fact, &["f2".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id(), "f2");
        assert!(kb.get(Category::Trait, "f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replies_filtered_by_subject() {
        let kb = InMemoryKnowledgeBase::new();
        let mut rx = kb.subscribe_replies();
        kb.record_reply("ei", Some("hi".into())).await.unwrap();
        kb.record_reply("bob", None).await.unwrap();
        let replies = kb.replies("ei").await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].content.as_deref(), Some("hi"));
        assert_eq!(rx.recv().await.unwrap().subject_id, "ei");
    }

    #[tokio::test]
    async fn reply_log_keeps_latest_per_subject() {
        let kb = InMemoryKnowledgeBase::new();
        for i in 0..REPLY_LOG_LIMIT + 5 {
            kb.record_reply("ei", Some(format!("reply {i}"))).await.unwrap();
        }
        kb.record_reply("bob", Some("hi".into())).await.unwrap();

        let replies = kb.replies("ei").await;
        assert_eq!(replies.len(), REPLY_LOG_LIMIT);
        assert_eq!(replies[0].content.as_deref(), Some("reply 5"));
        assert_eq!(kb.replies("bob").await.len(), 1);
    }
}
