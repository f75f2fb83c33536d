/// Header list shared between config (`extra_headers`) and adapter wire
/// requests. Name comparisons are case-insensitive per RFC 9110.
pub type Headers = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: &str, value: impl Into<String>) {
    let value = value.into();
    for (k, v) in headers.iter_mut() {
        if k.eq_ignore_ascii_case(name) {
            *v = value;
            return;
        }
    }
    headers.push((name.to_string(), value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_case_insensitive_and_set_replaces() {
        let mut headers: Headers = vec![("Content-Type".into(), "application/json".into())];
        assert_eq!(header_get(&headers, "content-type"), Some("application/json"));

        header_set(&mut headers, "content-TYPE", "text/event-stream");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "Content-Type"), Some("text/event-stream"));

        header_set(&mut headers, "x-api-key", "k");
        assert_eq!(headers.len(), 2);
    }
}
