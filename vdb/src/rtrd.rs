// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route target and route distinguisher list codec.
//!
//! Target lists are persisted as a single comma joined string. The encoding
//! preserves order and does not deduplicate, so for any sequence of strings
//! that contain no commas `decode(encode(x)) == x`.

use crate::error::Error;

const SEPARATOR: char = ',';

/// Join an ordered list of targets into its persisted form.
pub fn encode<S: AsRef<str>>(targets: &[S]) -> String {
    let mut out = String::new();
    for (i, t) in targets.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.push_str(t.as_ref());
    }
    out
}

/// Split a persisted target string back into its ordered list. An empty or
/// absent value decodes to an empty list.
pub fn decode(value: Option<&str>) -> Vec<String> {
    match value {
        None | Some("") => Vec::new(),
        Some(s) => s.split(SEPARATOR).map(String::from).collect(),
    }
}

/// Check that every target can be encoded without loss. Targets must be
/// non-empty and must not contain the separator.
pub fn validate<S: AsRef<str>>(field: &str, targets: &[S]) -> Result<(), Error> {
    for t in targets {
        let t = t.as_ref();
        if t.is_empty() {
            return Err(Error::Validation(format!(
                "{field}: empty value is not allowed"
            )));
        }
        if t.contains(SEPARATOR) {
            return Err(Error::Validation(format!(
                "{field}: '{t}' must not contain '{SEPARATOR}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_examples() {
        assert_eq!(encode::<&str>(&[]), "");
        assert_eq!(encode(&["65000:1", "65000:2"]), "65000:1,65000:2");
    }

    #[test]
    fn decode_examples() {
        assert!(decode(None).is_empty());
        assert!(decode(Some("")).is_empty());
        assert_eq!(
            decode(Some("65000:2,65000:1,65000:2")),
            vec!["65000:2", "65000:1", "65000:2"],
        );
    }

    #[test]
    fn encode_decoded_string() {
        let s = "64512:10,64512:20,1.2.3.4:7";
        assert_eq!(encode(&decode(Some(s))), s);
    }

    #[test]
    fn validate_rejects_lossy_targets() {
        assert!(validate("route_targets", &["64512:1"]).is_ok());
        assert!(matches!(
            validate("route_targets", &["64512:1,64512:2"]),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            validate("import_targets", &[""]),
            Err(Error::Validation(_))
        ));
    }
}
