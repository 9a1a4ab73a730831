//! Course id extraction from user input: a bare numeric id, a course URL, or
//! the HTML of a course landing page.

use std::sync::OnceLock;

use regex::Regex;

fn og_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"og:image"\s+content="[^"]*/(\d+)_"#)
            .unwrap_or_else(|e| panic!("invalid og:image pattern: {e}"))
    })
}

fn course_id_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""course_id"\s*:\s*(\d+)"#)
            .unwrap_or_else(|e| panic!("invalid course_id pattern: {e}"))
    })
}

fn data_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"data-(?:course-id|clp-course-id)="(\d+)""#)
            .unwrap_or_else(|e| panic!("invalid data attribute pattern: {e}"))
    })
}

/// Bare numeric input is already a course id.
pub fn parse_numeric(input: &str) -> Option<u64> {
    input.trim().parse().ok()
}

/// Normalize a course URL to its landing page: fragments dropped, lecture
/// deep links (`/learn/lecture/...`) cut back to the course root, trailing
/// slash removed.
pub fn clean_course_url(url: &str) -> String {
    let url = url.split('#').next().unwrap_or(url);
    let url = match url.find("/learn/") {
        Some(idx) => &url[..idx],
        None => url,
    };
    url.trim_end_matches('/').to_string()
}

/// Scan a course landing page for the numeric course id. Several markers are
/// tried in order of reliability.
pub fn extract_from_page(html: &str) -> Option<u64> {
    for re in [og_image_re(), course_id_json_re(), data_attr_re()] {
        if let Some(caps) = re.captures(html)
            && let Ok(id) = caps[1].parse()
        {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_input_parses() {
        assert_eq!(parse_numeric(" 12345 "), Some(12345));
        assert_eq!(parse_numeric("course-slug"), None);
    }

    #[test]
    fn urls_are_cleaned_to_the_landing_page() {
        assert_eq!(
            clean_course_url("https://example.com/course/rust-basics/"),
            "https://example.com/course/rust-basics"
        );
        assert_eq!(
            clean_course_url("https://example.com/course/rust-basics/learn/lecture/123#overview"),
            "https://example.com/course/rust-basics"
        );
    }

    #[test]
    fn page_markers_are_tried_in_order() {
        let og = r#"<meta property="og:image" content="https://img.example.com/course/480x270/98765_abc.jpg">"#;
        assert_eq!(extract_from_page(og), Some(98765));

        let json = r#"<script>{"course_id": 4242,"x":1}</script>"#;
        assert_eq!(extract_from_page(json), Some(4242));

        let attr = r#"<div data-clp-course-id="777"></div>"#;
        assert_eq!(extract_from_page(attr), Some(777));

        assert_eq!(extract_from_page("<html></html>"), None);
    }
}
