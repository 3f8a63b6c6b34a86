//! Text format read and written by the `prefix_scan` driver: an element count
//! followed by that many whitespace separated values.

use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("input is empty, expected an element count")]
    MissingLength,
    #[error("invalid element count {0:?}")]
    InvalidLength(String),
    #[error("invalid value {token:?} at position {index}")]
    InvalidValue { index: usize, token: String },
    #[error("expected {expected} values, found {found}")]
    Truncated { expected: usize, found: usize },
}

pub fn read_sequence<R: Read>(mut reader: R) -> Result<Vec<f32>, InputError> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    parse_sequence(&text)
}

pub fn parse_sequence(text: &str) -> Result<Vec<f32>, InputError> {
    let mut tokens = text.split_whitespace();
    let len = tokens.next().ok_or(InputError::MissingLength)?;
    let len = len
        .parse::<usize>()
        .map_err(|_| InputError::InvalidLength(len.to_string()))?;

    // The count is untrusted, so memory is only taken for values present.
    let xs = tokens
        .take(len)
        .enumerate()
        .map(|(index, token)| {
            token.parse::<f32>().map_err(|_| InputError::InvalidValue {
                index,
                token: token.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if xs.len() < len {
        return Err(InputError::Truncated {
            expected: len,
            found: xs.len(),
        });
    }
    Ok(xs)
}

/// Writes every value with `precision` decimals, each followed by a space,
/// then ends the line.
pub fn write_sequence<W: Write>(mut writer: W, xs: &[f32], precision: usize) -> io::Result<()> {
    for x in xs {
        write!(writer, "{:.*} ", precision, x)?;
    }
    writeln!(writer)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sequence_test() {
        let xs = parse_sequence("4\n1 2.5\n-3   4e1\n").unwrap();
        assert_eq!(xs, vec![1.0, 2.5, -3.0, 40.0]);

        let xs = parse_sequence("0").unwrap();
        assert!(xs.is_empty());

        // Values past the count are ignored.
        let xs = parse_sequence("1 7 8 9").unwrap();
        assert_eq!(xs, vec![7.0]);
    }

    #[test]
    fn parse_sequence_errors() {
        assert!(matches!(parse_sequence("  \n"), Err(InputError::MissingLength)));
        assert!(matches!(parse_sequence("-1 2"), Err(InputError::InvalidLength(_))));
        assert!(matches!(
            parse_sequence("3 1 x 2"),
            Err(InputError::InvalidValue { index: 1, .. })
        ));
        assert!(matches!(
            parse_sequence("3 1 2"),
            Err(InputError::Truncated {
                expected: 3,
                found: 2
            })
        ));

        // Huge counts are reported as truncated input, not allocated.
        assert!(matches!(
            parse_sequence("4000000000000 1 2"),
            Err(InputError::Truncated {
                expected: 4_000_000_000_000,
                found: 2
            })
        ));
        assert!(matches!(
            parse_sequence("18446744073709551615 1 2"),
            Err(InputError::Truncated {
                expected: usize::MAX,
                found: 2
            })
        ));
    }

    #[test]
    fn write_sequence_test() {
        let mut out = Vec::new();
        write_sequence(&mut out, &[1.0, 3.0, 6.25], 3).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1.000 3.000 6.250 \n");

        let mut out = Vec::new();
        write_sequence(&mut out, &[], 3).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "\n");
    }
}
