//! Rolling-hash snippet matcher
//!
//! Finds where a captured snippet now lives in an edited document. Both the
//! snippet and the document are reduced to a stream of significant characters
//! (whitespace and line breaks are dropped, line breaks are still counted) and
//! hashed over fixed windows with a polynomial rolling hash.
//!
//! The document is scanned once. A bounded queue keeps the last `K` document
//! windows, where `K` is the number of distinct snippet window hashes, together
//! with a running count of how many of them belong to the snippet. The first
//! position with the highest count above the similarity threshold wins, except
//! that a later position with the same count whose queue starts on the
//! snippet's first window replaces one that does not.

use std::collections::{HashSet, VecDeque};

/// Number of significant characters per hashed window
pub const WINDOW: usize = 8;

/// Polynomial base
const BASE: i64 = 53;

/// Hash modulus (2^20)
const MODULUS: i64 = 1 << 20;

/// Fraction of snippet hashes a window queue must contain to count as a match
const THRESHOLD: f64 = 0.8;

/// Characters that carry no signal for matching
fn is_skipped(c: char) -> bool {
    matches!(c, '\r' | '\t' | ' ' | '\n')
}

/// A complete window: its hash and the line its first character sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    hash: i64,
    start_line: usize,
}

/// Rolling hash over the significant characters of a text
struct RollingHash {
    chars: VecDeque<(i64, usize)>,
    hash: i64,
    /// BASE^(WINDOW-1) mod MODULUS, used to drop the outgoing character
    high: i64,
}

impl RollingHash {
    fn new() -> Self {
        let mut high = 1;
        for _ in 1..WINDOW {
            high = (high * BASE).rem_euclid(MODULUS);
        }
        Self {
            chars: VecDeque::with_capacity(WINDOW),
            hash: 0,
            high,
        }
    }

    /// Feed one significant character, returning the window it completes
    fn push(&mut self, c: char, line: usize) -> Option<Window> {
        let value = c as i64;

        if self.chars.len() == WINDOW {
            if let Some((old, _)) = self.chars.pop_front() {
                self.hash = (self.hash - old * self.high).rem_euclid(MODULUS);
            }
        }

        self.hash = (self.hash * BASE + value).rem_euclid(MODULUS);
        self.chars.push_back((value, line));

        if self.chars.len() == WINDOW {
            self.chars.front().map(|&(_, start_line)| Window {
                hash: self.hash,
                start_line,
            })
        } else {
            None
        }
    }
}

/// Every complete window of `text`, in order
fn windows(text: &str) -> Vec<Window> {
    let mut roller = RollingHash::new();
    let mut line = 0;
    let mut out = Vec::new();

    for c in text.chars() {
        if c == '\n' {
            line += 1;
        }
        if is_skipped(c) {
            continue;
        }
        if let Some(window) = roller.push(c, line) {
            out.push(window);
        }
    }

    out
}

/// Line of the first significant character of `text`
fn first_significant_line(text: &str) -> usize {
    let mut line = 0;
    for c in text.chars() {
        if c == '\n' {
            line += 1;
        } else if !is_skipped(c) {
            break;
        }
    }
    line
}

/// Locate `snippet` inside `document`
///
/// Returns the document line that corresponds to the snippet's first line,
/// or `None` when no position is similar enough.
pub fn find_snippet(snippet: &str, document: &str) -> Option<usize> {
    let snippet_windows = windows(snippet);
    if snippet_windows.is_empty() {
        return None;
    }

    let wanted: HashSet<i64> = snippet_windows.iter().map(|w| w.hash).collect();
    let leading = snippet_windows[0].hash;
    let capacity = wanted.len();
    let required = THRESHOLD * capacity as f64;

    let mut queue: VecDeque<Window> = VecDeque::with_capacity(capacity + 1);
    let mut score = 0usize;
    let mut best_score = 0usize;
    let mut best_line: Option<usize> = None;
    let mut best_aligned = false;

    let mut roller = RollingHash::new();
    let mut line = 0;

    for c in document.chars() {
        if c == '\n' {
            line += 1;
        }
        if is_skipped(c) {
            continue;
        }
        let Some(window) = roller.push(c, line) else {
            continue;
        };

        if wanted.contains(&window.hash) {
            score += 1;
        }
        queue.push_back(window);

        if queue.len() > capacity {
            if let Some(dropped) = queue.pop_front() {
                if wanted.contains(&dropped.hash) {
                    score -= 1;
                }
            }
        }

        if score as f64 >= required {
            // Duplicate windows let a queue reach full score one line early
            let aligned = queue.front().map_or(false, |w| w.hash == leading);
            if score > best_score || (score == best_score && aligned && !best_aligned) {
                best_score = score;
                best_line = queue.front().map(|w| w.start_line);
                best_aligned = aligned;
            }
        }
    }

    let candidate = best_line? as i64;
    let offset = first_significant_line(snippet) as i64;
    Some((candidate - offset).max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(i: usize) -> String {
        let mixed = (i as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        format!("{:012x}", mixed >> 16)
    }

    fn sample_document(lines: usize) -> String {
        (0..lines)
            .map(|i| format!("let {} = {};", token(i), token(i + 7919)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn lines_slice(doc: &str, start: usize, end: usize) -> String {
        let lines: Vec<&str> = doc.lines().collect();
        let mut out = lines[start..end].join("\n");
        out.push('\n');
        out
    }

    #[test]
    fn test_hash_stays_in_range() {
        let mut roller = RollingHash::new();
        for (i, c) in "zzzzzzzzzzzzzzzzzzzzzzzz\u{10FFFF}".chars().enumerate() {
            if let Some(w) = roller.push(c, i) {
                assert!(w.hash >= 0 && w.hash < MODULUS);
            }
        }
    }

    #[test]
    fn test_rolling_matches_direct_hash() {
        let text = "abcdefghijkl";
        let rolled = windows(text);
        assert_eq!(rolled.len(), text.len() - WINDOW + 1);

        for (i, w) in rolled.iter().enumerate() {
            let direct = text[i..i + WINDOW]
                .chars()
                .fold(0i64, |h, c| (h * BASE + c as i64).rem_euclid(MODULUS));
            assert_eq!(w.hash, direct);
        }
    }

    #[test]
    fn test_whitespace_is_ignored() {
        let a = windows("fn main() {\n    run();\n}");
        let b = windows("fn main(){\r\n\trun();}");
        let ha: Vec<i64> = a.iter().map(|w| w.hash).collect();
        let hb: Vec<i64> = b.iter().map(|w| w.hash).collect();
        assert_eq!(ha, hb);
    }

    #[test]
    fn test_window_start_lines() {
        let w = windows("ab\ncdefghij");
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].start_line, 0);
        assert_eq!(w[1].start_line, 0);
        assert_eq!(w[2].start_line, 1);
    }

    #[test]
    fn test_find_exact_snippet() {
        let doc = sample_document(40);
        let snippet = lines_slice(&doc, 12, 20);
        assert_eq!(find_snippet(&snippet, &doc), Some(12));
    }

    #[test]
    fn test_find_snippet_after_insertions() {
        let doc = sample_document(40);
        let snippet = lines_slice(&doc, 12, 20);

        let mut edited: Vec<String> = doc.lines().map(String::from).collect();
        for i in 0..6 {
            edited.insert(3, format!("// inserted comment number {}", i));
        }
        let edited = edited.join("\n");

        assert_eq!(find_snippet(&snippet, &edited), Some(18));
    }

    #[test]
    fn test_find_snippet_with_small_edit_inside() {
        let doc = sample_document(40);
        let snippet = lines_slice(&doc, 12, 22);
        let edited = doc.replace(&token(15), "0123456789ab");

        assert_eq!(find_snippet(&snippet, &edited), Some(12));
    }

    #[test]
    fn test_no_match_in_unrelated_text() {
        let doc = sample_document(40);
        let snippet = "completely different content\nthat never appears anywhere\n";
        assert_eq!(find_snippet(snippet, &doc), None);
    }

    #[test]
    fn test_leading_blank_lines_in_snippet() {
        let doc = format!("header line here\n\n\n{}", sample_document(10));
        let snippet = lines_slice(&doc, 1, 8);
        assert_eq!(find_snippet(&snippet, &doc), Some(1));
    }

    #[test]
    fn test_repeated_windows_map_to_first_line() {
        let body = "x = x + 1;\n".repeat(6);
        let doc = format!("start();\nprepare();\n{}finish();\n", body);
        let snippet = format!("prepare();\n{}", body);
        assert_eq!(find_snippet(&snippet, &doc), Some(1));
    }

    #[test]
    fn test_snippet_too_short_for_window() {
        assert_eq!(find_snippet("a b\nc", "a b c d e f g h i"), None);
    }

    #[test]
    fn test_shared_window_on_previous_line() {
        let doc = "use std::env;\n\nfn main() {\n    let args: Vec<String> = env::args().collect();\n    if args.len() < 2 {\n        println!(\"usage: greet <name>\");\n        return;\n    }\n    let name = &args[1];\n    println!(\"hello, {}\", name);\n    greet(name);\n\n    println!(\"done\");\n}\n\nfn greet(name: &str) {\n    println!(\"greetings, {}\", name);\n    for c in name.chars() {\n        println!(\"{}\", c);\n    }\n}\n\n#[cfg(test)]\nmod tests {}\n";
        let lines: Vec<&str> = doc.split('\n').collect();

        // Lines 9..14 and 16..21 start on a window that also ends the line before
        let snippet = format!("{}\n", lines[9..14].join("\n"));
        assert_eq!(find_snippet(&snippet, doc), Some(9));
        let snippet = format!("{}\n", lines[16..21].join("\n"));
        assert_eq!(find_snippet(&snippet, doc), Some(16));
    }
}
