/// Helper to get the current system time in milliseconds.
///
/// All timestamps stored by the coordinator (heartbeats, failures, checkpoints,
/// quarantine deadlines) use this clock so they can be serialized and compared directly.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
