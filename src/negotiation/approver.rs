use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::models::Format;

/// A policy restricting which subscribers may deliver which formats.
///
/// Formats without a registered restriction may be delivered by any subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriberApprover {
    restrictions: HashMap<Format, HashSet<String>>,
}

impl SubscriberApprover {
    /// Create a new approver which approves every subscriber for every format.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the given format to the given subscribers.
    pub fn with_restriction<I, S>(mut self, format: Format, subscriber_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restrictions
            .entry(format)
            .or_default()
            .extend(subscriber_ids.into_iter().map(Into::into));
        self
    }

    /// Check if the given subscriber is approved to deliver the given format.
    pub fn is_approved(&self, format: Format, subscriber_id: &str) -> bool {
        match self.restrictions.get(&format) {
            None => true,
            Some(allowed) => allowed.contains(subscriber_id),
        }
    }
}

impl FromStr for SubscriberApprover {
    type Err = anyhow::Error;

    /// Parse restrictions of the form `FORMAT=id1,id2;FORMAT=id3`.
    fn from_str(s: &str) -> Result<Self> {
        let mut approver = Self::new();
        for entry in s.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (name, ids) = entry
                .split_once('=')
                .with_context(|| format!("format approval `{}` must be of the form FORMAT=id1,id2", entry))?;
            let format = match Format::from_name(name) {
                Some(format) => format,
                None => bail!("unknown format `{}` in format approvals", name.trim()),
            };
            let ids: Vec<_> = ids.split(',').map(str::trim).filter(|id| !id.is_empty()).collect();
            if ids.is_empty() {
                bail!("format approval for {} names no subscribers", format.name());
            }
            approver = approver.with_restriction(format, ids);
        }
        Ok(approver)
    }
}
