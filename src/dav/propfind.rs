use chrono::{DateTime, NaiveDateTime};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::util::path as remote_path;

use super::types::{DEFAULT_CONTENT_TYPE, DIR_MIME_TYPE, FetchError, RemoteEntry};

/// Raw property set accumulated for one `<d:response>` element.
#[derive(Debug, Default)]
struct RawResponse {
    href: Option<String>,
    etag: Option<String>,
    content_type: Option<String>,
    content_length: Option<String>,
    last_modified: Option<String>,
    creation_date: Option<String>,
    remote_id: Option<String>,
    permissions: Option<String>,
    is_collection: bool,
}

/// Parse a PROPFIND multistatus body into the immediate children of
/// `folder_path`. The response element for the folder itself is dropped.
///
/// Individual malformed entries are skipped or recorded with sentinel
/// defaults; only a body that is not a multistatus at all is an error.
pub fn parse_listing(
    xml: &str,
    dav_root: &str,
    folder_path: &str,
) -> Result<Vec<RemoteEntry>, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut saw_multistatus = false;

    let mut current: Option<RawResponse> = None;
    // Props seen in the current <d:propstat>, committed only on 200 status.
    let mut pending = RawResponse::default();
    let mut status_ok = false;
    let mut in_resourcetype = false;
    let mut text_target: Option<Field> = None;

    #[derive(Clone, Copy, PartialEq)]
    enum Field {
        Href,
        Etag,
        ContentType,
        ContentLength,
        LastModified,
        CreationDate,
        RemoteId,
        Permissions,
        Status,
    }

    let mut status_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) => {
                // Self-closing elements: either a marker inside resourcetype
                // (e.g. <d:collection/>) or an empty property.
                if in_resourcetype && !local_name(e.name().as_ref()).is_empty() {
                    pending.is_collection = true;
                }
            }
            Ok(Event::Start(e)) => {
                let qname = e.name();
                let name = local_name(qname.as_ref());
                if in_resourcetype && !name.is_empty() {
                    // Any child element inside resourcetype marks a folder.
                    pending.is_collection = true;
                    continue;
                }
                match name {
                    "multistatus" => saw_multistatus = true,
                    "response" => {
                        current = Some(RawResponse::default());
                    }
                    "propstat" => {
                        pending = RawResponse::default();
                        status_ok = false;
                        status_text.clear();
                    }
                    "resourcetype" => in_resourcetype = true,
                    "href" => text_target = Some(Field::Href),
                    "getetag" => text_target = Some(Field::Etag),
                    "getcontenttype" => text_target = Some(Field::ContentType),
                    "getcontentlength" => text_target = Some(Field::ContentLength),
                    "getlastmodified" => text_target = Some(Field::LastModified),
                    "creationdate" => text_target = Some(Field::CreationDate),
                    "fileid" | "id" => text_target = Some(Field::RemoteId),
                    "permissions" => text_target = Some(Field::Permissions),
                    "status" => text_target = Some(Field::Status),
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let Some(field) = text_target else { continue };
                let text = match t.unescape() {
                    Ok(s) => s.into_owned(),
                    Err(_) => continue,
                };
                match field {
                    Field::Href => {
                        if let Some(resp) = current.as_mut() {
                            resp.href = Some(text);
                        }
                    }
                    Field::Etag => pending.etag = Some(text),
                    Field::ContentType => pending.content_type = Some(text),
                    Field::ContentLength => pending.content_length = Some(text),
                    Field::LastModified => pending.last_modified = Some(text),
                    Field::CreationDate => pending.creation_date = Some(text),
                    Field::RemoteId => pending.remote_id = Some(text),
                    Field::Permissions => pending.permissions = Some(text),
                    Field::Status => status_text = text,
                }
            }
            Ok(Event::End(e)) => {
                let qname = e.name();
                let name = local_name(qname.as_ref());
                match name {
                    "resourcetype" => in_resourcetype = false,
                    "status" => {
                        status_ok = status_text.contains(" 200 ");
                        text_target = None;
                    }
                    "propstat" => {
                        if status_ok
                            && let Some(resp) = current.as_mut()
                        {
                            merge_props(resp, std::mem::take(&mut pending));
                        }
                    }
                    "response" => {
                        if let Some(resp) = current.take()
                            && let Some(entry) = normalize_entry(resp, dav_root)
                            && entry.path != folder_path
                        {
                            entries.push(entry);
                        }
                    }
                    _ => text_target = None,
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FetchError::Protocol(format!("malformed multistatus: {e}")));
            }
            _ => {}
        }
    }

    if !saw_multistatus {
        return Err(FetchError::Protocol(
            "response body is not a DAV multistatus".into(),
        ));
    }

    Ok(entries)
}

fn merge_props(resp: &mut RawResponse, p: RawResponse) {
    resp.etag = p.etag.or(resp.etag.take());
    resp.content_type = p.content_type.or(resp.content_type.take());
    resp.content_length = p.content_length.or(resp.content_length.take());
    resp.last_modified = p.last_modified.or(resp.last_modified.take());
    resp.creation_date = p.creation_date.or(resp.creation_date.take());
    resp.remote_id = p.remote_id.or(resp.remote_id.take());
    resp.permissions = p.permissions.or(resp.permissions.take());
    resp.is_collection |= p.is_collection;
}

/// Turn one raw response into a `RemoteEntry`, applying the sentinel rules:
/// missing content-type becomes octet-stream, a collection marker forces the
/// DIR sentinel, etag quotes are stripped, bad timestamps become epoch zero.
fn normalize_entry(raw: RawResponse, dav_root: &str) -> Option<RemoteEntry> {
    let href = match raw.href {
        Some(h) => h,
        None => {
            tracing::warn!("multistatus response without href, skipping entry");
            return None;
        }
    };

    let decoded = percent_decode_str(&href).decode_utf8_lossy();
    let stripped = decoded.strip_prefix(dav_root).unwrap_or(&decoded);
    let mut path = remote_path::normalize(stripped);

    let is_directory = raw.is_collection;
    if is_directory {
        path = remote_path::as_folder_path(&path);
    }
    let name = remote_path::name_of(&path).to_string();

    let mut partial_data = false;

    let length = if is_directory {
        0
    } else {
        match raw.content_length.as_deref().map(str::parse::<i64>) {
            Some(Ok(n)) if n >= 0 => n,
            _ => {
                partial_data = true;
                0
            }
        }
    };

    let modification_timestamp = match raw.last_modified.as_deref().and_then(parse_date) {
        Some(ts) => ts,
        None => {
            partial_data = true;
            0
        }
    };
    // Creation date is optional on most servers; its absence alone does not
    // mark the entry as partial.
    let creation_timestamp = raw.creation_date.as_deref().and_then(parse_date).unwrap_or(0);

    let content_type = if is_directory {
        DIR_MIME_TYPE.to_string()
    } else {
        raw.content_type
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    };

    Some(RemoteEntry {
        path,
        name,
        etag: raw.etag.as_deref().map(strip_etag_quotes),
        content_type,
        length,
        creation_timestamp,
        modification_timestamp,
        is_directory,
        remote_id: raw.remote_id,
        permissions: raw.permissions,
        partial_data,
    })
}

/// Strip a weak-validator prefix and the enclosing quote characters.
pub fn strip_etag_quotes(etag: &str) -> String {
    let s = etag.strip_prefix("W/").unwrap_or(etag);
    s.trim_matches('"').to_string()
}

/// Parse a server timestamp, trying each known format in order.
/// Returns epoch seconds, or `None` when no format matches.
fn parse_date(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp());
    }
    None
}

/// Element name without its namespace prefix.
fn local_name(qname: &[u8]) -> &str {
    let raw = match qname.iter().position(|&b| b == b':') {
        Some(idx) => &qname[idx + 1..],
        None => qname,
    };
    std::str::from_utf8(raw).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAV_ROOT: &str = "/remote.php/dav/files/alice";

    fn listing_xml() -> &'static str {
        r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/remote.php/dav/files/alice/Documents/</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"folder-etag"</d:getetag>
        <d:resourcetype><d:collection/></d:resourcetype>
        <oc:fileid>100</oc:fileid>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/Documents/report.pdf</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"e1"</d:getetag>
        <d:getcontenttype>application/pdf</d:getcontenttype>
        <d:getcontentlength>2048</d:getcontentlength>
        <d:getlastmodified>Mon, 16 Jun 2025 10:30:45 GMT</d:getlastmodified>
        <d:resourcetype/>
        <oc:fileid>101</oc:fileid>
        <oc:permissions>RGDNVW</oc:permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/Documents/Sub%20Folder/</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>W/"e2"</d:getetag>
        <d:getcontenttype>text/html</d:getcontenttype>
        <d:resourcetype><d:collection/></d:resourcetype>
        <oc:fileid>102</oc:fileid>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/Documents/odd.bin</d:href>
    <d:propstat>
      <d:prop>
        <d:getetag>"e3"</d:getetag>
        <d:getlastmodified>not a date</d:getlastmodified>
        <d:resourcetype/>
        <oc:fileid>103</oc:fileid>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#
    }

    #[test]
    fn parses_children_and_skips_self() {
        let entries = parse_listing(listing_xml(), DAV_ROOT, "/Documents/").unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/Documents/report.pdf",
                "/Documents/Sub Folder/",
                "/Documents/odd.bin"
            ]
        );
    }

    #[test]
    fn file_entry_fields() {
        let entries = parse_listing(listing_xml(), DAV_ROOT, "/Documents/").unwrap();
        let file = &entries[0];
        assert!(!file.is_directory);
        assert_eq!(file.etag.as_deref(), Some("e1"));
        assert_eq!(file.content_type, "application/pdf");
        assert_eq!(file.length, 2048);
        assert_eq!(file.name, "report.pdf");
        assert_eq!(file.remote_id.as_deref(), Some("101"));
        assert_eq!(file.permissions.as_deref(), Some("RGDNVW"));
        assert!(file.modification_timestamp > 0);
        assert!(!file.partial_data);
    }

    #[test]
    fn collection_marker_forces_directory() {
        let entries = parse_listing(listing_xml(), DAV_ROOT, "/Documents/").unwrap();
        let dir = &entries[1];
        // Reported text/html content type is overridden by the collection marker.
        assert!(dir.is_directory);
        assert_eq!(dir.content_type, DIR_MIME_TYPE);
        assert_eq!(dir.length, 0);
        assert_eq!(dir.path, "/Documents/Sub Folder/");
        // Weak validator prefix and quotes are stripped.
        assert_eq!(dir.etag.as_deref(), Some("e2"));
    }

    #[test]
    fn bad_fields_get_sentinels_not_rejection() {
        let entries = parse_listing(listing_xml(), DAV_ROOT, "/Documents/").unwrap();
        let odd = &entries[2];
        assert_eq!(odd.length, 0);
        assert_eq!(odd.modification_timestamp, 0);
        assert_eq!(odd.content_type, DEFAULT_CONTENT_TYPE);
        assert!(odd.partial_data);
    }

    #[test]
    fn non_multistatus_is_a_protocol_error() {
        let err = parse_listing("<html>login page</html>", DAV_ROOT, "/").unwrap_err();
        assert!(matches!(err, FetchError::Protocol(_)));
    }

    #[test]
    fn etag_quote_stripping() {
        assert_eq!(strip_etag_quotes("\"abc\""), "abc");
        assert_eq!(strip_etag_quotes("W/\"abc\""), "abc");
        assert_eq!(strip_etag_quotes("abc"), "abc");
    }

    #[test]
    fn date_formats_tried_in_order() {
        assert_eq!(
            parse_date("Thu, 01 Jan 1970 00:00:01 GMT"),
            Some(1),
        );
        assert_eq!(parse_date("1970-01-01T00:00:02Z"), Some(2));
        assert_eq!(parse_date("1970-01-01 00:00:03"), Some(3));
        assert_eq!(parse_date("gibberish"), None);
    }
}
