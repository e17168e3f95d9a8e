//! Row change announcements for read models.

use crate::error::Result;
use crate::stream::Stream;
use crate::types::{Message, Subject};
use serde::Serialize;
use std::sync::Arc;

/// Publishes `<name>.table:updated` and `<name>.table:deleted` messages.
///
/// A read model that keeps a table announces its changes on the derived
/// domain `<name>.table` so other consumers can follow it.
#[derive(Clone)]
pub struct EntityPublisher {
    updated: Subject,
    deleted: Subject,
    stream: Arc<dyn Stream>,
}

impl EntityPublisher {
    pub fn new(stream: Arc<dyn Stream>, name: &str) -> Result<Self> {
        let domain = format!("{}.table", name);
        Ok(Self {
            updated: Subject::new(domain.as_str(), "updated")?,
            deleted: Subject::new(domain, "deleted")?,
            stream,
        })
    }

    /// The domain changes are published on.
    pub fn domain(&self) -> &str {
        self.updated.domain()
    }

    /// Subjects to declare as produced.
    pub fn produces(&self) -> Vec<Subject> {
        vec![self.updated.clone(), self.deleted.clone()]
    }

    pub fn changed(&self, row: &impl Serialize) -> Result<()> {
        self.stream.publish(Message::json(self.updated.clone(), row)?)
    }

    pub fn deleted(&self, row: &impl Serialize) -> Result<()> {
        self.stream.publish(Message::json(self.deleted.clone(), row)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandlerResult, StreamError};
    use crate::stream::MemoryStream;
    use crossbeam_channel::unbounded;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Team {
        id: u32,
        name: String,
    }

    #[test]
    fn test_changed_and_deleted() {
        let stream = MemoryStream::new();
        let publisher = EntityPublisher::new(Arc::new(stream.clone()), "team").unwrap();
        assert_eq!(publisher.domain(), "team.table");

        let (tx, rx) = unbounded();
        let _sub = stream
            .subscribe("team.table", Arc::new(move |msg: &Message| -> HandlerResult {
                let _ = tx.send(msg.clone());
                Ok(())
            }))
            .unwrap();

        let team = Team {
            id: 7,
            name: "Ulve".into(),
        };
        publisher.changed(&team).unwrap();
        publisher.deleted(&team).unwrap();

        let updated = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(updated.subject().to_string(), "team.table:updated");
        assert_eq!(updated.decode_body::<Team>().unwrap(), team);

        let deleted = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(deleted.subject().to_string(), "team.table:deleted");
    }

    #[test]
    fn test_rejects_bad_name() {
        let result = EntityPublisher::new(Arc::new(MemoryStream::new()), "a:b");
        assert!(matches!(result, Err(StreamError::InvalidSubject(_))));
    }
}
