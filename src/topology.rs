//! Subscription ordering over the consumed/produced domain graph.
//!
//! Domains are nodes and consumers are edges from what they consume to what
//! they produce. Subscribing leaves first means every derived domain already
//! has its listeners when the roots that feed it start delivering, so no
//! buffering is needed in between.
//!
//! ```text
//!    s1   s2
//!    ^     ^
//!   /       \
//!  c1        c2
//!   \
//!    v
//!    s2
//! ```

use crate::consumer::Registration;
use std::collections::{BTreeMap, BTreeSet};

/// Consumed and produced domains of a set of registrations.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    consumed: BTreeSet<String>,
    produced: BTreeSet<String>,
    /// Producer names per produced domain.
    producers: BTreeMap<String, Vec<String>>,
}

impl Topology {
    pub fn new(registrations: &[Registration]) -> Self {
        let mut topology = Self::default();
        for registration in registrations {
            for subject in registration.consumes() {
                topology.consumed.insert(subject.domain().to_string());
            }

            let mut produced: BTreeSet<String> = BTreeSet::new();
            for subject in registration.produces() {
                produced.insert(subject.domain().to_string());
            }
            for domain in produced {
                topology
                    .producers
                    .entry(domain.clone())
                    .or_default()
                    .push(registration.name().to_string());
                topology.produced.insert(domain);
            }
        }
        topology
    }

    /// Every domain in subscription order: produced-only, then produced and
    /// consumed, then roots. Each group is sorted.
    pub fn sorted_domains(&self) -> Vec<String> {
        let leaves = self.produced.iter().filter(|d| !self.consumed.contains(*d));
        let inner = self.produced.iter().filter(|d| self.consumed.contains(*d));
        let roots = self.consumed.iter().filter(|d| !self.produced.contains(*d));
        leaves.chain(inner).chain(roots).cloned().collect()
    }

    /// Consumed and produced by no one: fed from outside the switch.
    pub fn is_root(&self, domain: &str) -> bool {
        self.consumed.contains(domain) && !self.produced.contains(domain)
    }

    /// Produced by some registration.
    pub fn is_derived(&self, domain: &str) -> bool {
        self.produced.contains(domain)
    }

    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.consumed
            .iter()
            .filter(move |d| !self.produced.contains(*d))
            .map(String::as_str)
    }

    /// Domains with more than one producer, with the producer names.
    pub fn duplicate_producers(&self) -> Vec<(&str, &[String])> {
        self.producers
            .iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(domain, names)| (domain.as_str(), names.as_slice()))
            .collect()
    }
}
