use crate::mailbox::imap::RawMessage;
use crate::models::{Attachment, StoredEmail};
use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const NO_SUBJECT: &str = "(no subject)";
const DEFAULT_ATTACHMENT_NAME: &str = "attachment";
const DEFAULT_ATTACHMENT_TYPE: &str = "application/octet-stream";

/// Turns a raw fetched message into the stored shape.
///
/// `now` stands in for a missing or unparseable `Date` header.
pub fn parse_message(
    raw: &RawMessage,
    account_id: &str,
    folder: &str,
    now: DateTime<Utc>,
) -> Result<StoredEmail, mailparse::MailParseError> {
    let parsed = mailparse::parse_mail(&raw.body)?;
    let headers = &parsed.headers;

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| synthesize_message_id(&raw.body));

    let subject = headers
        .get_first_value("Subject")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let (from_address, from_name) = addresses(&parsed, "From")
        .into_iter()
        .next()
        .unwrap_or_default();

    let received_at = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or(now);

    let mut body = Body::default();
    collect_parts(&parsed, &mut body);

    Ok(StoredEmail {
        id: Uuid::new_v4().to_string(),
        message_id,
        account_id: account_id.to_string(),
        subject,
        from_address,
        from_name,
        to_addresses: address_list(&parsed, "To"),
        cc_addresses: address_list(&parsed, "Cc"),
        bcc_addresses: address_list(&parsed, "Bcc"),
        text_body: body.text,
        html_body: body.html,
        attachments: body.attachments,
        is_read: raw.seen,
        is_starred: raw.flagged,
        folder: folder.to_string(),
        received_at,
    })
}

/// Stable stand-in for a missing `Message-ID`: the same bytes always map
/// to the same id, so a message fetched twice is still stored once.
pub fn synthesize_message_id(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    format!("<{}@synthesized.invalid>", hex::encode(&digest[..16]))
}

/// `(address, display name)` pairs, with group members flattened.
fn addresses(parsed: &ParsedMail, header: &str) -> Vec<(String, String)> {
    let Some(header) = parsed.headers.get_first_header(header) else {
        return Vec::new();
    };
    let Ok(list) = mailparse::addrparse_header(header) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for addr in list.iter() {
        match addr {
            MailAddr::Single(info) => {
                out.push((info.addr.clone(), info.display_name.clone().unwrap_or_default()));
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push((info.addr.clone(), info.display_name.clone().unwrap_or_default()));
                }
            }
        }
    }
    out
}

fn address_list(parsed: &ParsedMail, header: &str) -> Vec<String> {
    addresses(parsed, header)
        .into_iter()
        .map(|(addr, _)| addr)
        .collect()
}

#[derive(Default)]
struct Body {
    text: String,
    html: String,
    attachments: Vec<Attachment>,
}

fn collect_parts(part: &ParsedMail, body: &mut Body) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, body);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let mimetype = part.ctype.mimetype.to_lowercase();
    let is_attachment = disposition.disposition == DispositionType::Attachment
        || filename.is_some()
        || !mimetype.starts_with("text/");

    if is_attachment {
        let content = part.get_body_raw().unwrap_or_default();
        let content_type = if mimetype.is_empty() {
            DEFAULT_ATTACHMENT_TYPE.to_string()
        } else {
            mimetype
        };
        body.attachments.push(Attachment {
            filename: filename
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ATTACHMENT_NAME.to_string()),
            content_type,
            size: content.len() as u64,
            content,
        });
        return;
    }

    let text = part.get_body().unwrap_or_default();
    if mimetype == "text/html" {
        if body.html.is_empty() {
            body.html = text;
        }
    } else if body.text.is_empty() {
        body.text = text;
    }
}
