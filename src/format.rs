//! Parameter packing descriptors.
//!
//! Every registered parameter carries a format string describing its on-wire
//! layout. Tokens: `b` byte, `w` 16-bit word, `l` 32-bit long, `u` 48-bit
//! unique id, `v` optional trailing unique id, `a` ASCII text of up to 32
//! bytes, `xNN` a literal byte given as two hex digits, `$` terminator.
//! Whitespace is ignored and an unterminated format repeats, so `"w"`
//! describes a list of words. All multi-byte tokens are big-endian; parameter
//! data is stored in the slab already packed, so encoding is a bounded,
//! token-shaped copy.

const ASCII_LEN_MAX: usize = 32;

fn token_size(token: char) -> Option<usize> {
    Some(match token {
        'b' | 'B' => 1,
        'w' | 'W' => 2,
        'l' | 'L' => 4,
        'u' | 'U' | 'v' | 'V' => 6,
        _ => return None,
    })
}

/// Computes the packed size described by `format`, or `None` when the format
/// is not a valid descriptor. Unterminated formats report the largest whole
/// number of repetitions that fits a maximum-size parameter.
pub fn format_size(format: &str) -> Option<usize> {
    let mut size = 0usize;
    let mut terminated = false;
    let mut chars = format.chars();

    while let Some(token) = chars.next() {
        if token == ' ' {
            continue;
        }

        let token_len = match token {
            '$' => {
                terminated = true;
                0
            },
            'v' | 'V' | 'a' | 'A' => {
                terminated = true;
                if token == 'a' || token == 'A' {
                    ASCII_LEN_MAX
                } else {
                    6
                }
            },
            'x' | 'X' => {
                for _ in 0..2 {
                    if !chars.next()?.is_ascii_hexdigit() {
                        return None;
                    }
                }
                1
            },
            _ => token_size(token)?,
        };

        size += token_len;
        if size > crate::consts::RDM_MAX_PDL {
            return None;
        }

        if terminated {
            // Nothing may follow a terminating token.
            return match chars.next() {
                None | Some('$') => Some(size),
                Some(_) => None,
            };
        }
    }

    if size == 0 {
        return None;
    }

    let max = crate::consts::RDM_MAX_PDL;
    Some(max - (max % size))
}

pub fn is_valid(format: &str) -> bool {
    format_size(format).is_some()
}

/// Copies packed parameter data from `src` to `dest`, shaped by `format`.
///
/// The format repeats while source bytes remain. ASCII tokens stop at the
/// first NUL and, when `encode_nulls` is set, append one to the output.
/// Returns the number of bytes written to `dest`.
pub fn encode(dest: &mut [u8], format: &str, src: &[u8], encode_nulls: bool) -> usize {
    let mut written = 0usize;
    let mut read = 0usize;

    while read < src.len() {
        let mut chars = format.chars();
        while let Some(token) = chars.next() {
            if token == ' ' {
                continue;
            }

            match token {
                '$' => return written,
                'a' | 'A' => {
                    let remaining = &src[read..];
                    let len = remaining
                        .iter()
                        .position(|&byte| byte == 0)
                        .unwrap_or(remaining.len())
                        .min(ASCII_LEN_MAX)
                        .min(dest.len() - written);
                    dest[written..written + len].copy_from_slice(&remaining[..len]);
                    written += len;
                    if encode_nulls && written < dest.len() {
                        dest[written] = 0;
                        written += 1;
                    }
                    return written;
                },
                'v' | 'V' => {
                    let remaining = &src[read..];
                    if remaining.len() < 6 || remaining[..6] == [0u8; 6] {
                        // The optional uid was not provided.
                        if encode_nulls && written + 6 <= dest.len() {
                            dest[written..written + 6].fill(0);
                            written += 6;
                        }
                        return written;
                    }
                    if written + 6 > dest.len() {
                        return written;
                    }
                    dest[written..written + 6].copy_from_slice(&remaining[..6]);
                    written += 6;
                    return written;
                },
                'x' | 'X' => {
                    let high = chars.next().and_then(|c| c.to_digit(16));
                    let low = chars.next().and_then(|c| c.to_digit(16));
                    let (Some(high), Some(low)) = (high, low) else {
                        return written;
                    };
                    if written >= dest.len() || read >= src.len() {
                        return written;
                    }
                    dest[written] = ((high << 4) | low) as u8;
                    written += 1;
                    read += 1;
                },
                _ => {
                    let Some(len) = token_size(token) else {
                        return written;
                    };
                    if read + len > src.len() || written + len > dest.len() {
                        return written;
                    }
                    dest[written..written + len].copy_from_slice(&src[read..read + len]);
                    written += len;
                    read += len;
                },
            }
        }
    }

    written
}
