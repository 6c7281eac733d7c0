//! Endpoint IDs in URL paths

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Bytes that cannot appear raw in a path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Encode an endpoint ID as a single URL path segment.
///
/// Route extractors decode it back to the same ID.
pub fn endpoint_path_segment(endpoint_id: &str) -> String {
    utf8_percent_encode(endpoint_id, PATH_SEGMENT).to_string()
}
