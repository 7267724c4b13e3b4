use std::sync::Arc;

use confcache::ConfLoader;

use crate::conf_object::ConfObject;
use crate::error::Result;
use crate::segment_manager::SegmentOps;

/// Everything a registered conf type needs to supply: how to parse a whole
/// file into a conf object and, for segmented types, the `segment_ops`
/// vtable (§4.7). Non-segmented types (CCB, domain-tagging) simply return
/// `None` from `segment_ops`.
pub trait ConfKind: Send + Sync {
    /// Parses a complete, already-opened file into a conf object (§4.3/§4.6
    /// `reload`). Implementations read through `loader` with whatever flags
    /// their file format needs.
    fn parse(&self, loader: &mut ConfLoader) -> Result<Arc<dyn ConfObject>>;

    fn segment_ops(&self) -> Option<Arc<dyn SegmentOps>> {
        None
    }
}

#[cfg(test)]
pub(crate) struct NoopKind;

#[cfg(test)]
impl ConfKind for NoopKind {
    fn parse(&self, _loader: &mut ConfLoader) -> Result<Arc<dyn ConfObject>> {
        struct Empty;
        impl ConfObject for Empty {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
            fn type_name(&self) -> &'static str {
                "noop"
            }
        }
        Ok(Arc::new(Empty))
    }
}
