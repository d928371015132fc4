/// Derive a stable-ish identifier for this process.
///
/// Prefers the `GROUPCART_NODE_ID` environment variable.  Falls back to
/// `<hostname>-<random-8-chars>` so that every process gets a unique id even
/// on the same host.  The id is written into each cart mutex so a lock that
/// outlives its holder can be traced back to it.
pub fn node_id() -> String {
    std::env::var("GROUPCART_NODE_ID")
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| {
            let hostname = gethostname::gethostname().to_string_lossy().into_owned();
            let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
            format!("{hostname}-{suffix}")
        })
}
