/// Default number of characters kept from the first message.
pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;
pub const TITLE_ELLIPSIS: &str = "…";

/// Derives a session title from the first message of a conversation.
///
/// Counts Unicode scalar values so multi-byte text is never cut mid-character.
pub fn derive_title(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TITLE_ELLIPSIS}", &content[..cut]),
        None => content.to_string(),
    }
}
