//! Outbound response shaping: split a reply into platform-sized chunks on
//! line boundaries.

/// Split `text` into chunks of at most `limit` bytes, preferring line
/// boundaries. A single line longer than the limit is hard-split on char
/// boundaries.
pub fn split_response(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![text.to_string()]
        };
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > limit {
            for piece in hard_split(line, limit) {
                chunks.push(piece);
            }
            continue;
        }
        current.push_str(line);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .map(|c| c.trim_end_matches('\n').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Split one oversized line into `limit`-byte pieces on char boundaries.
fn hard_split(line: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in line.chars() {
        if current.len() + ch.len_utf8() > limit {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
