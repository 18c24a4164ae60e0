//! Stop-string matching over the growing generated text.
//!
//! Matching is byte-oriented: the generated buffer may end mid-codepoint, so
//! all scanning works on `&[u8]` and reported positions are byte offsets.
//! Two modes exist:
//! - **Full**: find a complete stop string near the end of the buffer. The
//!   search window is bounded by the stop string length plus the last token's
//!   length, so each token costs O(window), not O(buffer).
//! - **Partial**: detect whether the buffer *ends with a prefix of* a stop
//!   string, letting a streaming caller withhold a not-yet-disambiguated
//!   suffix instead of emitting it as normal output.

/// How to match against the configured stop set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Full,
    Partial,
}

/// A successful match against the stop set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopMatch {
    /// Byte offset in the scanned text where the (full or partial) stop
    /// string begins.
    pub pos: usize,
    /// Index of the matched stop string in the configured set.
    pub word: usize,
}

/// Scan `text` for the configured stop strings.
///
/// `last_token_len` is the byte length of the most recently appended token
/// piece; it bounds the full-match search window so earlier content is never
/// re-scanned. The earliest match position wins; ties break toward the
/// earliest word in the set's iteration order. Empty stop strings never
/// match.
pub fn find_stopping_strings(
    text: &[u8],
    last_token_len: usize,
    stops: &[String],
    mode: StopMode,
) -> Option<StopMatch> {
    let mut best: Option<StopMatch> = None;

    for (word_idx, word) in stops.iter().enumerate() {
        if word.is_empty() {
            continue;
        }
        let needle = word.as_bytes();

        let pos = match mode {
            StopMode::Full => {
                let window = needle.len() + last_token_len;
                let from = text.len().saturating_sub(window);
                find_subslice(text, needle, from)
            }
            StopMode::Partial => find_partial_stop(needle, text),
        };

        if let Some(pos) = pos {
            let better = best.as_ref().map_or(true, |b| pos < b.pos);
            if better {
                best = Some(StopMatch {
                    pos,
                    word: word_idx,
                });
            }
        }
    }

    best
}

/// Byte offset where the buffer's trailing bytes form a proper prefix of
/// `stop`, or `None` if the buffer cannot be extending into `stop`.
///
/// Scans `stop` from its last character backward looking for the character
/// equal to the buffer's final byte, then verifies the buffer ends with that
/// prefix of `stop`.
pub fn find_partial_stop(stop: &[u8], text: &[u8]) -> Option<usize> {
    let (&last, _) = text.split_last()?;
    if stop.is_empty() {
        return None;
    }

    for i in (0..stop.len()).rev() {
        if stop[i] == last {
            let partial = &stop[..=i];
            if text.ends_with(partial) {
                return Some(text.len() - partial.len());
            }
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let from = from.min(haystack.len());
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn full_match_reports_word_position() {
        let text = b"...banSTOPana";
        let m = find_stopping_strings(text, 4, &stops(&["STOP"]), StopMode::Full).unwrap();
        assert_eq!(m.pos, 6);
        assert_eq!(m.word, 0);
    }

    #[test]
    fn full_match_window_excludes_old_content() {
        // "STOP" appeared long ago; with a 1-byte last token the window only
        // covers the tail and the stale occurrence is not re-found.
        let text = b"STOP followed by a lot of other text y";
        assert_eq!(
            find_stopping_strings(text, 1, &stops(&["STOP"]), StopMode::Full),
            None
        );
    }

    #[test]
    fn full_match_straddling_last_token() {
        // Stop string completed by the final token piece.
        let text = b"hello STO";
        assert_eq!(
            find_stopping_strings(text, 3, &stops(&["STOP"]), StopMode::Full),
            None
        );
        let text = b"hello STOP";
        let m = find_stopping_strings(text, 1, &stops(&["STOP"]), StopMode::Full).unwrap();
        assert_eq!(m.pos, 6);
    }

    #[test]
    fn earliest_position_wins() {
        let text = b"xxAByyCDzz";
        let m =
            find_stopping_strings(text, text.len(), &stops(&["CD", "AB"]), StopMode::Full).unwrap();
        assert_eq!(m.pos, 2);
        assert_eq!(m.word, 1);
    }

    #[test]
    fn tie_breaks_on_configured_order() {
        let text = b"zzHALT";
        let m = find_stopping_strings(text, text.len(), &stops(&["HALT", "HALT"]), StopMode::Full)
            .unwrap();
        assert_eq!(m.word, 0);
    }

    #[test]
    fn empty_stop_strings_never_match() {
        let text = b"anything";
        assert_eq!(
            find_stopping_strings(text, 8, &stops(&["", ""]), StopMode::Full),
            None
        );
        assert_eq!(find_partial_stop(b"", b"anything"), None);
    }

    #[test]
    fn partial_detects_trailing_prefix() {
        assert_eq!(find_partial_stop(b"STOP", b"banana ST"), Some(7));
        assert_eq!(find_partial_stop(b"STOP", b"banana STO"), Some(7));
        assert_eq!(find_partial_stop(b"STOP", b"banana S"), Some(7));
    }

    #[test]
    fn partial_ignores_non_suffix_occurrence() {
        assert_eq!(find_partial_stop(b"STOP", b"STO banana"), None);
        assert_eq!(find_partial_stop(b"STOP", b"banana"), None);
    }

    #[test]
    fn partial_handles_repeated_last_char() {
        // The last 'a' could start "abc" even though an earlier 'a' exists.
        assert_eq!(find_partial_stop(b"aab", b"xyzaa"), Some(3));
    }

    #[test]
    fn partial_mode_through_main_entry() {
        let text = b"some output <|";
        let m = find_stopping_strings(text, 2, &stops(&["<|end|>"]), StopMode::Partial).unwrap();
        assert_eq!(m.pos, 12);
    }

    #[test]
    fn empty_text_never_matches() {
        assert_eq!(
            find_stopping_strings(b"", 0, &stops(&["STOP"]), StopMode::Full),
            None
        );
        assert_eq!(find_partial_stop(b"STOP", b""), None);
    }
}
