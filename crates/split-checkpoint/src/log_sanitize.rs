// Child programs (tar, zstd, aws, scp) write progress bars and colour codes.
// Lines are cleaned before they reach the log so a CI log viewer never
// interprets them.

const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy)]
enum Skip {
    // Saw ESC, waiting for the introducer.
    Intro,
    // CSI: ends at a final byte in '@'..='~'.
    Csi,
    // String sequence (OSC/DCS/PM/APC): ends at BEL or ESC '\'.
    Str { bel_ends: bool },
    StrEsc { bel_ends: bool },
}

pub fn clean_output_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut skip: Option<Skip> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = skip {
            skip = match (state, c) {
                (Skip::Intro, '[') => Some(Skip::Csi),
                (Skip::Intro, ']') => Some(Skip::Str { bel_ends: true }),
                (Skip::Intro, 'P' | 'X' | '^' | '_') => Some(Skip::Str { bel_ends: false }),
                (Skip::Intro, _) => None,
                (Skip::Csi, '@'..='~') => None,
                (Skip::Csi, _) => Some(Skip::Csi),
                (Skip::Str { bel_ends: true }, '\x07') => None,
                (Skip::Str { bel_ends }, '\x1b') => Some(Skip::StrEsc { bel_ends }),
                (Skip::Str { bel_ends }, _) => Some(Skip::Str { bel_ends }),
                (Skip::StrEsc { .. }, '\\') => None,
                (Skip::StrEsc { bel_ends }, '\x1b') => Some(Skip::StrEsc { bel_ends }),
                (Skip::StrEsc { bel_ends }, _) => Some(Skip::Str { bel_ends }),
            };
            continue;
        }

        match c {
            '\x1b' => {
                skip = Some(Skip::Intro);
                continue;
            }
            '\t' => out.push(' '),
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out.trim_end().to_string()
}

fn is_bidi_control(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}
