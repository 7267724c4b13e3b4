use std::any::Any;

/// The common header every conf variant embeds in the original (`{type_vtable,
/// refcount}`, §3). In safe Rust the vtable is just `Any + Send + Sync` and
/// the refcount is `Arc`'s own strong count — there is no separate `free`
/// method because `Drop` already runs it when the last `Arc` goes away.
pub trait ConfObject: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Human-readable type tag, used for logging and report-on-load labels.
    fn type_name(&self) -> &'static str;
}
