//! Minimal W3C trace-context propagation.
//!
//! Observability backends plug in as ordinary middleware; the built-in
//! stages only make sure `traceparent` flows across the broker so a
//! backend on either side can stitch spans together.

use uuid::Uuid;

/// A parsed `traceparent` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: String,
    pub parent_id: String,
    pub flags: String,
}

impl TraceParent {
    /// Start a brand new trace.
    pub fn root() -> Self {
        let trace = Uuid::new_v4();
        Self {
            trace_id: hex32(trace),
            parent_id: fresh_span_id(),
            flags: "01".to_string(),
        }
    }

    /// Continue an existing trace under a fresh span id.
    pub fn child_of(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_id: fresh_span_id(),
            flags: self.flags.clone(),
        }
    }

    /// Parse `00-<32 hex>-<16 hex>-<2 hex>`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let parent_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != "00" {
            return None;
        }
        if trace_id.len() != 32 || parent_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        if ![trace_id, parent_id, flags]
            .iter()
            .all(|s| s.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            parent_id: parent_id.to_ascii_lowercase(),
            flags: flags.to_ascii_lowercase(),
        })
    }

    pub fn render(&self) -> String {
        format!("00-{}-{}-{}", self.trace_id, self.parent_id, self.flags)
    }
}

fn hex32(id: Uuid) -> String {
    id.simple().to_string()
}

fn fresh_span_id() -> String {
    let bytes = Uuid::new_v4();
    hex32(bytes)[..16].to_string()
}
