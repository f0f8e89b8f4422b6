//! Minimal `application/x-www-form-urlencoded` helpers for the device build,
//! where request bodies arrive as raw bytes and outgoing URLs are assembled by hand.

/// Percent-encodes a query component. Unreserved characters pass through.
pub fn encode_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Decodes `+` and `%XX` escapes. Invalid escapes are kept literally.
pub fn decode_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(high), Some(low)) => {
                        decoded.push(high << 4 | low);
                        i += 3;
                    }
                    _ => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                decoded.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Splits a urlencoded body into decoded `(name, value)` pairs.
pub fn parse_pairs(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(name), decode_component(value))
        })
        .collect()
}

/// Joins `(name, value)` pairs into an encoded query string.
pub fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(name, value)| format!("{}={}", encode_component(name), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_spaces_and_accents() {
        assert_eq!(encode_component("Santa Marta"), "Santa%20Marta");
        assert_eq!(encode_component("Bogotá"), "Bogot%C3%A1");
    }

    #[test]
    fn decodes_form_values() {
        assert_eq!(decode_component("Santa+Marta"), "Santa Marta");
        assert_eq!(decode_component("Bogot%C3%A1"), "Bogotá");
        assert_eq!(decode_component("100%"), "100%");
        assert_eq!(decode_component("%zz"), "%zz");
    }

    #[test]
    fn parses_body_pairs() {
        let pairs = parse_pairs("city=Cali&weather=MANUAL&temp=21.5&flag");

        assert_eq!(
            pairs,
            vec![
                ("city".to_string(), "Cali".to_string()),
                ("weather".to_string(), "MANUAL".to_string()),
                ("temp".to_string(), "21.5".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }
}
