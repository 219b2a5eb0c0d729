/// Splits `text` into pieces of at most `max_size` characters, preferring
/// paragraph breaks, then line breaks, then a hard cut.
///
/// Pieces are produced lazily and borrow from `text`. Whitespace around each
/// break is trimmed; nothing else is lost.
pub fn split(text: &str, max_size: usize) -> Chunks<'_> {
    Chunks {
        remaining: text.trim(),
        max_size: max_size.max(1),
    }
}

pub struct Chunks<'a> {
    remaining: &'a str,
    max_size: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.remaining.is_empty() {
            return None;
        }

        let Some(limit) = byte_offset(self.remaining, self.max_size) else {
            let last = self.remaining;
            self.remaining = "";
            return Some(last);
        };

        let split_at = find_break(self.remaining, limit, self.max_size).unwrap_or(limit);
        let (chunk, rest) = self.remaining.split_at(split_at);
        self.remaining = rest.trim_start();
        Some(chunk)
    }
}

/// Byte offset of the `n`th character, or `None` when the text is `n` characters or shorter.
fn byte_offset(text: &str, n: usize) -> Option<usize> {
    text.char_indices().nth(n).map(|(idx, _)| idx)
}

fn find_break(text: &str, limit: usize, max_size: usize) -> Option<usize> {
    let far_enough = |pos: usize| 2 * text[..pos].chars().count() >= max_size;

    // A "\n\n" starting right at the limit still yields a full-size chunk.
    let para_end = limit + text[limit..].chars().take(2).map(char::len_utf8).sum::<usize>();
    let para_window = &text[..para_end];
    if let Some(pos) = para_window.rfind("\n\n").filter(|&pos| far_enough(pos)) {
        return Some(pos);
    }

    text[..limit].rfind('\n').filter(|&pos| far_enough(pos))
}
