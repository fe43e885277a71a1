//! Deterministic-script injection for replayed HTML
//!
//! Prepends a fixed inline script that pins the page's clock and entropy
//! sources so replayed pages execute identically run to run.

/// The injected fragment. Seeds are constants so every replay observes
/// the same `Date`, `Math.random`, and high-resolution timer sequences.
pub const DETERMINISTIC_SCRIPT: &str = "<script>\
(function(){\
var seed=0.462;\
var count=0;\
Math.random=function(){count+=1;return (seed*count)%1;};\
var start=1204251968254;\
var ticks=0;\
var RealDate=Date;\
var now=function(){ticks+=1;return start+ticks*3;};\
Date=function(a,b,c,d,e,f,g){\
switch(arguments.length){\
case 0:return new RealDate(now());\
case 1:return new RealDate(a);\
default:return new RealDate(a,b,c,d,e,f,g);}};\
Date.prototype=RealDate.prototype;\
Date.now=function(){return now();};\
Date.parse=RealDate.parse;\
Date.UTC=RealDate.UTC;\
if(window.performance){\
var perfTicks=0;\
window.performance.now=function(){perfTicks+=1;return perfTicks*0.1;};}\
})();\
</script>";

/// Whether a Content-Type denotes an HTML document
#[must_use]
pub fn is_html(content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    media == "text/html" || media == "application/xhtml+xml"
}

/// Inject the deterministic script into an HTML document
///
/// The fragment lands immediately after the first `<head>` tag, after
/// `<html>` when there is no head, or at the document start otherwise.
/// It is inserted exactly once.
#[must_use]
pub fn inject(body: &[u8]) -> Vec<u8> {
    let position = insertion_point(body);
    let mut out = Vec::with_capacity(body.len() + DETERMINISTIC_SCRIPT.len());
    out.extend_from_slice(&body[..position]);
    out.extend_from_slice(DETERMINISTIC_SCRIPT.as_bytes());
    out.extend_from_slice(&body[position..]);
    out
}

fn insertion_point(body: &[u8]) -> usize {
    find_tag_end(body, b"<head").or_else(|| find_tag_end(body, b"<html")).unwrap_or(0)
}

/// Find the byte just past the closing `>` of the first occurrence of
/// `tag` as an element open tag (case-insensitive; `<head` must not match
/// `<header>`)
fn find_tag_end(body: &[u8], tag: &[u8]) -> Option<usize> {
    let lower: Vec<u8> = body.iter().map(u8::to_ascii_lowercase).collect();
    let mut search_from = 0;
    while let Some(offset) = find(&lower[search_from..], tag) {
        let start = search_from + offset;
        let after = start + tag.len();
        match lower.get(after) {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(b'/') => {
                let close = lower[after..].iter().position(|&b| b == b'>')?;
                return Some(after + close + 1);
            }
            Some(_) => {
                search_from = after;
            }
            None => return None,
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
        let mut count = 0;
        let mut pos = 0;
        while let Some(offset) = find(&haystack[pos..], needle) {
            count += 1;
            pos += offset + 1;
        }
        count
    }

    #[test]
    fn test_is_html() {
        assert!(is_html("text/html"));
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("application/xhtml+xml"));
        assert!(!is_html("text/plain"));
        assert!(!is_html("application/json"));
    }

    #[test]
    fn test_inject_after_head() {
        let html = b"<html><head><title>t</title></head><body></body></html>";
        let injected = inject(html);
        let expected_prefix = format!("<html><head>{DETERMINISTIC_SCRIPT}<title>");
        assert!(injected.starts_with(expected_prefix.as_bytes()));
    }

    #[test]
    fn test_inject_before_other_scripts() {
        let html = b"<html><head><script>var x=1;</script></head></html>";
        let injected = inject(html);
        let ours = find(&injected, b"Math.random").unwrap();
        let theirs = find(&injected, b"var x=1;").unwrap();
        assert!(ours < theirs);
    }

    #[test]
    fn test_inject_exactly_once() {
        let html = b"<html><head></head><body><head></head></body></html>";
        let injected = inject(html);
        assert_eq!(count_occurrences(&injected, b"Math.random"), 1);
    }

    #[test]
    fn test_inject_no_head_uses_html() {
        let html = b"<html><body>x</body></html>";
        let injected = inject(html);
        let expected_prefix = format!("<html>{DETERMINISTIC_SCRIPT}<body>");
        assert!(injected.starts_with(expected_prefix.as_bytes()));
    }

    #[test]
    fn test_inject_no_markup_prepends() {
        let html = b"plain text document";
        let injected = inject(html);
        assert!(injected.starts_with(DETERMINISTIC_SCRIPT.as_bytes()));
        assert!(injected.ends_with(b"plain text document"));
    }

    #[test]
    fn test_head_with_attributes() {
        let html = b"<html><HEAD lang=\"en\"><title>t</title></HEAD></html>";
        let injected = inject(html);
        let after_head = find(&injected, b"en\">").unwrap() + 4;
        assert_eq!(
            &injected[after_head..after_head + DETERMINISTIC_SCRIPT.len()],
            DETERMINISTIC_SCRIPT.as_bytes()
        );
    }

    #[test]
    fn test_header_element_not_confused_with_head() {
        let html = b"<html><body><header>h</header></body></html>";
        let injected = inject(html);
        // no <head>, so the fragment follows <html>
        let expected_prefix = format!("<html>{DETERMINISTIC_SCRIPT}<body>");
        assert!(injected.starts_with(expected_prefix.as_bytes()));
    }

    #[test]
    fn test_length_grows_by_fragment() {
        let html = b"<html><head></head></html>";
        let injected = inject(html);
        assert_eq!(injected.len(), html.len() + DETERMINISTIC_SCRIPT.len());
    }
}
