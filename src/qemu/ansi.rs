//! Console escape handling.
//!
//! Kernels often color their log prefixes. Captured lines are cleaned before
//! they enter the log so that expectations can be written against plain text.

/// Remove ANSI escape sequences, carriage returns and stray control bytes.
///
/// Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL|ST`), DCS
/// (`ESC P ... ST`) and two-byte escapes. Tabs are kept.
pub fn clean_console_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                Some('[') => {
                    // Parameters and intermediates until a final byte in 0x40..=0x7e.
                    for next in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&next) {
                            break;
                        }
                    }
                }
                Some(']') | Some('P') => {
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some('(') | Some(')') => {
                    chars.next();
                }
                _ => {}
            },
            '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
