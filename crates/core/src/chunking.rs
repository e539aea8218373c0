use crate::error::IngestError;
use crate::models::Chunk;

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Unifies line endings, collapses runs of spaces and tabs, trims every line
/// and keeps at most one blank line between paragraphs.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0usize;

    for line in unified.split('\n') {
        let collapsed = normalize_whitespace(line);
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !lines.is_empty() {
                lines.push(String::new());
            }
            continue;
        }
        blank_run = 0;
        lines.push(collapsed);
    }

    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}

/// Splits text after `.`, `!`, `?` or `…` when followed by whitespace.
/// Each sentence comes back whitespace-normalized.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?' | '…') {
            continue;
        }
        let Some(&(next_position, next)) = chars.peek() else {
            continue;
        };
        if next.is_whitespace() {
            push_sentence(&mut sentences, &text[start..next_position]);
            start = next_position;
        }
    }
    push_sentence(&mut sentences, &text[start..]);

    sentences
}

fn push_sentence(target: &mut Vec<String>, raw: &str) {
    let sentence = normalize_whitespace(raw);
    if !sentence.is_empty() {
        target.push(sentence);
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Trailing part of `text` no longer than `overlap` characters, starting on
/// a word boundary.
fn overlap_seed(text: &str, overlap: usize) -> &str {
    let total = char_len(text);
    if overlap == 0 || total == 0 {
        return "";
    }
    if total <= overlap {
        return text;
    }

    let cut = text
        .char_indices()
        .nth(total - overlap)
        .map(|(index, _)| index)
        .unwrap_or(text.len());
    let tail = &text[cut..];

    let starts_on_boundary = text[..cut].ends_with(' ');
    if starts_on_boundary {
        return tail.trim_start();
    }
    match tail.find(' ') {
        Some(space) => tail[space..].trim_start(),
        None => "",
    }
}

/// Splits `text` into chunks of at most `max_size` characters on sentence
/// boundaries, falling back to word boundaries for oversize sentences. With
/// `overlap > 0` every chunk after the first starts with a suffix of the
/// previous chunk.
pub fn chunk_text(text: &str, max_size: usize, overlap: usize) -> Result<Vec<Chunk>, IngestError> {
    if max_size == 0 {
        return Err(IngestError::InvalidChunkConfig(
            "max_size must be greater than zero".to_string(),
        ));
    }
    if overlap >= max_size {
        return Err(IngestError::InvalidChunkConfig(format!(
            "overlap {overlap} must be smaller than max_size {max_size}"
        )));
    }

    let mut units = Vec::new();
    for sentence in split_sentences(text) {
        if char_len(&sentence) > max_size {
            units.extend(sentence.split(' ').map(str::to_string));
        } else {
            units.push(sentence);
        }
    }

    let mut pieces: Vec<String> = Vec::new();
    let mut buffer = String::new();
    let mut buffer_len = 0usize;
    // Length of the overlap seed at the head of `buffer`; a buffer that holds
    // nothing but its seed is never emitted.
    let mut seed_len = 0usize;

    for unit in units {
        let unit_len = char_len(&unit);
        let has_new_content = buffer_len > seed_len;

        if has_new_content && buffer_len + 1 + unit_len > max_size {
            let emitted = std::mem::take(&mut buffer);
            let seed = overlap_seed(&emitted, overlap).to_string();
            seed_len = char_len(&seed);
            buffer_len = seed_len;
            buffer = seed;
            pieces.push(emitted);
        }

        if !buffer.is_empty() {
            buffer.push(' ');
            buffer_len += 1;
        }
        buffer.push_str(&unit);
        buffer_len += unit_len;
    }

    if buffer_len > seed_len {
        pieces.push(buffer);
    }

    let total = pieces.len() as u64;
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            text,
            index: index as u64,
            total,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "The pump starts. Pressure rises quickly!   Does the valve open? \
        Yes, when the controller signals it. A very long sentence follows that keeps going \
        well past the limit so that it has to be broken on word boundaries instead.";

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        let normalized = normalize_whitespace(input);
        assert_eq!(normalized, "A lot of spacing");
    }

    #[test]
    fn non_breaking_spaces_collapse_like_spaces() {
        assert_eq!(normalize_whitespace("Fish\u{a0}\u{a0}& chips\u{a0}"), "Fish & chips");
    }

    #[test]
    fn text_normalization_unifies_line_endings() {
        let input = "first\r\nline  with\t gaps\r\r\r\nsecond\n\n\n\nthird  \n";
        assert_eq!(normalize_text(input), "first\nline with gaps\n\nsecond\n\nthird");
    }

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        let sentences = split_sentences("One. Two!  Three?\nFour 3.14 stays");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?", "Four 3.14 stays"]);
    }

    #[test]
    fn rejoined_chunks_reproduce_tokens_without_overlap() {
        let expected: Vec<&str> = SAMPLE.split_whitespace().collect();
        for size in [1, 5, 17, 40, 64, 500] {
            let chunks = chunk_text(SAMPLE, size, 0).expect("chunking should succeed");
            let joined = chunks
                .iter()
                .map(|chunk| chunk.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let actual: Vec<&str> = joined.split(' ').collect();
            assert_eq!(actual, expected, "size {size}");
        }
    }

    #[test]
    fn chunks_respect_the_size_limit() {
        let chunks = chunk_text(SAMPLE, 40, 0).expect("chunking should succeed");
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(char_len(&chunk.text) <= 40, "{:?}", chunk.text);
        }
    }

    #[test]
    fn overlapping_chunks_share_a_suffix() {
        let overlap = 12;
        let chunks = chunk_text(SAMPLE, 48, overlap).expect("chunking should succeed");
        assert!(chunks.len() > 2);

        for pair in chunks.windows(2) {
            let previous = &pair[0].text;
            let next = &pair[1].text;
            let shared = (0..=overlap.min(char_len(previous)))
                .rev()
                .find(|length| {
                    let suffix: String = previous
                        .chars()
                        .skip(char_len(previous) - length)
                        .collect();
                    !suffix.is_empty() && next.starts_with(&suffix)
                });
            assert!(shared.is_some(), "{previous:?} -> {next:?}");
        }
    }

    #[test]
    fn indices_and_totals_are_consistent() {
        let chunks = chunk_text(SAMPLE, 30, 5).expect("chunking should succeed");
        let total = chunks.len() as u64;
        for (position, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, position as u64);
            assert_eq!(chunk.total, total);
            assert!(!chunk.text.trim().is_empty());
        }
    }

    #[test]
    fn trailing_content_is_kept() {
        let chunks = chunk_text("Alpha beta. Gamma", 12, 0).expect("chunking should succeed");
        assert_eq!(
            chunks.iter().map(|chunk| chunk.text.as_str()).collect::<Vec<_>>(),
            vec!["Alpha beta.", "Gamma"]
        );
    }

    #[test]
    fn oversize_word_becomes_its_own_chunk() {
        let chunks = chunk_text("tiny supercalifragilistic end", 8, 0)
            .expect("chunking should succeed");
        assert_eq!(
            chunks.iter().map(|chunk| chunk.text.as_str()).collect::<Vec<_>>(),
            vec!["tiny", "supercalifragilistic", "end"]
        );
    }

    #[test]
    fn blank_text_yields_no_chunks() {
        assert!(chunk_text("  \n\t ", 10, 2).expect("chunking").is_empty());
    }

    #[test]
    fn invalid_sizes_are_rejected() {
        assert!(matches!(
            chunk_text("text", 0, 0),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(matches!(
            chunk_text("text", 10, 10),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    #[test]
    fn seed_starts_on_word_boundary() {
        assert_eq!(overlap_seed("alpha beta gamma", 8), "gamma");
        assert_eq!(overlap_seed("alpha beta gamma", 11), "beta gamma");
        assert_eq!(overlap_seed("alpha beta gamma", 3), "");
        assert_eq!(overlap_seed("short", 10), "short");
    }
}
