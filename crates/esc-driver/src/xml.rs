use quick_xml::{events::Event as XmlEvent, Reader as XmlReader};

/// Find the text content of the first `<tag>…</tag>` element in XML.
/// Skips over nested elements; returns `None` if not found or empty.
/// Grounded in `nclav-driver::aws::xml_text` (EC2/ELBv2/CloudWatch Query
/// responses are XML, so the Fake/Aws clients share this helper).
pub fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_tag = false;
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if !in_tag && e.local_name().as_ref() == tag_bytes {
                    in_tag = true;
                    depth = 0;
                } else if in_tag {
                    depth += 1;
                }
            }
            Ok(XmlEvent::End(_)) => {
                if in_tag {
                    if depth == 0 {
                        return None;
                    }
                    depth -= 1;
                }
            }
            Ok(XmlEvent::Text(e)) if in_tag && depth == 0 => {
                return e.unescape().ok().map(|s| s.into_owned());
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    None
}

/// Collect text content of every `<tag>…</tag>` element in XML.
pub fn xml_all_texts(xml: &str, tag: &str) -> Vec<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut result = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if depth == 0 && e.local_name().as_ref() == tag_bytes {
                    depth = 1;
                } else if depth > 0 {
                    depth += 1;
                }
            }
            Ok(XmlEvent::End(_)) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Ok(XmlEvent::Text(e)) if depth == 1 => {
                if let Ok(s) = e.unescape() {
                    result.push(s.into_owned());
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    result
}

/// Collect the raw inner XML of every `<tag>…</tag>` occurrence, so callers
/// can run `xml_text`/`xml_all_texts` again per-item (EC2 Query responses
/// wrap repeated records in `<item>` elements inside a `...Set` collection).
pub fn xml_items(xml: &str, tag: &str) -> Vec<String> {
    let tag_bytes = tag.as_bytes();
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut items = Vec::new();
    let mut depth: usize = 0;
    let mut start_pos: usize = 0;

    loop {
        let pos_before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                if depth == 0 && e.local_name().as_ref() == tag_bytes {
                    depth = 1;
                    start_pos = reader.buffer_position() as usize;
                } else if depth > 0 {
                    depth += 1;
                }
            }
            Ok(XmlEvent::Empty(e)) => {
                if depth == 0 && e.local_name().as_ref() == tag_bytes {
                    items.push(String::new());
                }
            }
            Ok(XmlEvent::End(e)) => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 && e.local_name().as_ref() == tag_bytes {
                        items.push(xml[start_pos..pos_before].to_string());
                    }
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }
    items
}

/// Parse the AWS error code from an XML error response.
pub fn xml_error_code(xml: &str) -> String {
    xml_text(xml, "Code")
        .or_else(|| xml_text(xml, "code"))
        .unwrap_or_else(|| "Unknown".into())
}

/// Parse the AWS error message from an XML error response.
pub fn xml_error_message(xml: &str) -> String {
    xml_text(xml, "Message")
        .or_else(|| xml_text(xml, "message"))
        .unwrap_or_else(|| "unknown error".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_text_finds_simple_element() {
        let xml = "<DescribeInstancesResponse><instanceId>i-abc123</instanceId></DescribeInstancesResponse>";
        assert_eq!(xml_text(xml, "instanceId"), Some("i-abc123".into()));
    }

    #[test]
    fn xml_text_returns_none_for_missing() {
        let xml = "<Foo><Bar>baz</Bar></Foo>";
        assert_eq!(xml_text(xml, "Missing"), None);
    }

    #[test]
    fn xml_all_texts_collects_every_match() {
        let xml = "<Items><member>a</member><member>b</member></Items>";
        assert_eq!(xml_all_texts(xml, "member"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn xml_items_splits_repeated_records() {
        let xml = "<instancesSet><item><instanceId>i-1</instanceId></item><item><instanceId>i-2</instanceId></item></instancesSet>";
        let items = xml_items(xml, "item");
        assert_eq!(items.len(), 2);
        assert_eq!(xml_text(&items[0], "instanceId"), Some("i-1".into()));
        assert_eq!(xml_text(&items[1], "instanceId"), Some("i-2".into()));
    }

    #[test]
    fn xml_error_helpers_parse_error_response() {
        let xml = r#"<Response><Errors><Error><Code>InvalidInstanceID.NotFound</Code><Message>no such instance</Message></Error></Errors></Response>"#;
        assert_eq!(xml_error_code(xml), "InvalidInstanceID.NotFound");
        assert_eq!(xml_error_message(xml), "no such instance");
    }
}
