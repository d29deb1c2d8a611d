//! Execution ID generation
//!
//! Generated IDs use the format: `{8-char-hex}-run-{robot-slug}`
//! Example: `7c1e09ab-run-invoice-bot`
//!
//! The hex part comes from the random tail of a v7 UUID; the timestamp head
//! changes too slowly to tell apart runs started close together.

/// Generate an execution ID for a robot
pub fn generate_id(domain_type: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let simple = uuid.simple().to_string();
    let hex_prefix = &simple[simple.len() - 8..];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", hex_prefix, domain_type)
    } else {
        format!("{}-{}-{}", hex_prefix, domain_type, slug)
    }
}

/// Slugify a title for use in IDs
fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
