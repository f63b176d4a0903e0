//! ANSI escape stripping for clean pattern matching.
//!
//! Terminal output is dense with color, cursor, and title sequences. Prompt
//! detection and the completion marker both match against plain text, so
//! every byte chunk is scrubbed before it reaches a matcher.

/// Parser state while walking a byte stream.
enum Scrub {
    /// Plain text.
    Text,
    /// Saw ESC, deciding what follows.
    Escape,
    /// Inside a CSI sequence (`ESC [` or bare 0x9B), skipping until the
    /// final byte in `0x40..=0x7E`.
    Csi,
    /// Inside an OSC sequence (`ESC ]`), skipping until BEL or `ESC \`.
    Osc,
}

/// Strip ANSI escape sequences and carriage returns from a byte slice.
///
/// Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL|ST`), bare CSI
/// (0x9B), and two-byte escapes. Invalid UTF-8 is replaced rather than
/// dropped.
pub fn scrub(input: &[u8]) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let mut state = Scrub::Text;
    let mut prev_esc_in_osc = false;

    for &byte in input {
        match state {
            Scrub::Text => match byte {
                0x1B => state = Scrub::Escape,
                0x9B => state = Scrub::Csi,
                b'\r' => {}
                b => out.push(b),
            },
            Scrub::Escape => match byte {
                b'[' => state = Scrub::Csi,
                b']' => {
                    prev_esc_in_osc = false;
                    state = Scrub::Osc;
                }
                // Two-byte escape (ESC 7, ESC M, ...): consume and move on.
                _ => state = Scrub::Text,
            },
            Scrub::Csi => {
                // Parameter and intermediate bytes are 0x20..=0x3F; the
                // final byte 0x40..=0x7E closes the sequence.
                if (0x40..=0x7E).contains(&byte) {
                    state = Scrub::Text;
                } else if !(0x20..=0x3F).contains(&byte) {
                    // Malformed sequence; drop back to text.
                    state = Scrub::Text;
                }
            }
            Scrub::Osc => {
                if byte == 0x07 || (prev_esc_in_osc && byte == b'\\') {
                    state = Scrub::Text;
                }
                prev_esc_in_osc = byte == 0x1B;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
