//! Cleans subprocess output before it reaches the terminal or the log.
//!
//! Tools like `e2fsck`, `resize2fs` and `unzip` emit colour codes and redraw
//! progress with carriage returns; only the final redraw of a line is kept.

const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC, DCS, PM and APC strings; `bell_ends` is only true for OSC.
    String { bell_ends: bool },
    StringEsc { bell_ends: bool },
}

pub fn sanitize_line(input: &str) -> String {
    // A bare `\r` means the tool redrew the line: keep the last visible frame.
    let frame = input
        .trim_end_matches(['\r', '\n'])
        .rsplit('\r')
        .find(|s| !s.trim().is_empty())
        .unwrap_or("");

    let mut out = String::with_capacity(frame.len().min(MAX_LINE_CHARS));
    let mut esc: Option<Escape> = None;
    let mut kept = 0usize;

    for c in frame.chars() {
        if let Some(state) = esc {
            esc = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::String { bell_ends: true }),
                (Escape::Start, 'P' | 'X' | '^' | '_') => {
                    Some(Escape::String { bell_ends: false })
                }
                (Escape::Start, _) => None,
                (Escape::Csi, '@'..='~') => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::String { bell_ends: true }, '\x07') => None,
                (Escape::String { bell_ends }, '\x1b') => Some(Escape::StringEsc { bell_ends }),
                (Escape::String { bell_ends }, _) => Some(Escape::String { bell_ends }),
                (Escape::StringEsc { .. }, '\\') => None,
                (Escape::StringEsc { bell_ends }, '\x1b') => Some(Escape::StringEsc { bell_ends }),
                (Escape::StringEsc { bell_ends }, _) => Some(Escape::String { bell_ends }),
            };
            continue;
        }
        match c {
            '\x1b' => esc = Some(Escape::Start),
            '\t' => {
                out.push(' ');
                kept += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...");
            break;
        }
    }

    out.trim_end().to_string()
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::sanitize_line;

    #[test]
    fn drops_colour_and_title_sequences() {
        let got = sanitize_line("e2fsck \u{1b}[1;32mclean\u{1b}[0m\u{1b}]0;title\u{7}!");
        assert_eq!(got, "e2fsck clean!");
    }

    #[test]
    fn keeps_only_last_progress_frame() {
        let got = sanitize_line("  10%\r  55%\r100% done\r\n");
        assert_eq!(got, "100% done");
    }

    #[test]
    fn trailing_redraw_to_blank_keeps_previous_frame() {
        assert_eq!(sanitize_line("resizing\r   \r"), "resizing");
    }

    #[test]
    fn strips_dcs_strings_and_bidi_controls() {
        assert_eq!(sanitize_line("a\u{1b}Pq#0\u{1b}\\b\t\u{202e}c"), "ab c");
    }
}
