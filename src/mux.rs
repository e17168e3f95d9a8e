//! Domain to stream routing.

use crate::error::Result;
use crate::stream::Stream;
use crate::types::Subject;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Routes each domain to the stream that carries it.
///
/// Domains without an explicit route use the fallback. The table is filled
/// before the switch is built and only read afterwards.
#[derive(Clone)]
pub struct StreamMux {
    fallback: Arc<dyn Stream>,
    routes: HashMap<String, Arc<dyn Stream>>,
}

impl StreamMux {
    pub fn new(fallback: Arc<dyn Stream>) -> Self {
        Self {
            fallback,
            routes: HashMap::new(),
        }
    }

    /// Route `domain` to `stream`, replacing an earlier route.
    pub fn handle(&mut self, stream: Arc<dyn Stream>, domain: &str) -> Result<()> {
        Subject::validate_domain(domain)?;
        self.routes.insert(domain.to_string(), stream);
        Ok(())
    }

    /// Route every domain in `domains` to `stream`.
    ///
    /// Validation happens before any route is added, so a bad domain leaves
    /// the table untouched.
    pub fn handles<'a>(&mut self, stream: Arc<dyn Stream>, domains: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let domains: Vec<&str> = domains.into_iter().collect();
        for domain in &domains {
            Subject::validate_domain(domain)?;
        }
        for domain in domains {
            self.routes.insert(domain.to_string(), stream.clone());
        }
        Ok(())
    }

    /// Builder form of [`StreamMux::handle`].
    pub fn with_route(mut self, stream: Arc<dyn Stream>, domain: &str) -> Result<Self> {
        self.handle(stream, domain)?;
        Ok(self)
    }

    pub fn lookup(&self, domain: &str) -> Arc<dyn Stream> {
        self.routes
            .get(domain)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn is_routed(&self, domain: &str) -> bool {
        self.routes.contains_key(domain)
    }
}

impl fmt::Debug for StreamMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut domains: Vec<&String> = self.routes.keys().collect();
        domains.sort();
        f.debug_struct("StreamMux").field("routes", &domains).finish()
    }
}
