//! Core data model: agents, sessions, traces, policies, approvals, alerts.

pub mod alert;
pub mod approval;
pub mod cost;
pub mod policy;
pub mod session;
pub mod trace;

/// Generate an id of the form `<prefix>_<n random alphanumerics>`.
///
/// Used for session ids (`ses_`) and approval ids (`apr_`). Trace ids use
/// [`trace::new_trace_id`] instead, since those must sort chronologically.
pub fn random_id(prefix: &str, n: usize) -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..n)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("{prefix}_{suffix}")
}
