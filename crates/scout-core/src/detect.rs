//! Heuristics for pages a plain HTTP client cannot render.

/// Lowercased markers of interstitials and bot walls.
const BLOCK_SIGNATURES: &[(&str, &str)] = &[
    ("just a moment...", "cloudflare interstitial"),
    ("cf-browser-verification", "cloudflare interstitial"),
    ("cf-challenge", "cloudflare challenge"),
    ("enable javascript", "javascript required"),
    ("you need to enable javascript", "javascript required"),
    ("please turn javascript on", "javascript required"),
    ("captcha", "captcha wall"),
    ("access denied", "access denied page"),
    ("checking your browser", "browser check"),
];

/// Bodies larger than this are treated as real pages even if they mention
/// a marker somewhere in the text.
const MAX_INTERSTITIAL_LEN: usize = 64 * 1024;

/// Returns why a successful response still needs a script-capable
/// transport, or `None` when the body looks like real content.
pub fn script_required(status: u16, body: &str) -> Option<&'static str> {
    if body.trim().is_empty() {
        return Some("empty body");
    }

    // Bot walls often come back as 403/503 with a challenge page.
    let challenge_status = matches!(status, 403 | 503);
    if body.len() > MAX_INTERSTITIAL_LEN && !challenge_status {
        return None;
    }

    let lowered = body.to_lowercase();
    BLOCK_SIGNATURES
        .iter()
        .find(|(marker, _)| lowered.contains(marker))
        .map(|(_, reason)| *reason)
}
