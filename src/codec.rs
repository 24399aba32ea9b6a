//! Article codec (C1): yEnc encoding, CRC32, header assembly, and the
//! message-id/subject/filename obfuscation rules of §4.1.

use crate::error::{Error, PostError, Result};
use crate::types::{Article, MessageIdFormat, ObfuscationPolicy, PartType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const YENC_LINE_LEN: usize = 128;

fn random_alnum_string(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| ALNUM[rng.gen_range(0..ALNUM.len())] as char)
        .collect()
}

/// `<32-alnum>@<8-alnum>.<3-alnum>`
pub fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "<{}@{}.{}>",
        random_alnum_string(&mut rng, 32),
        random_alnum_string(&mut rng, 8),
        random_alnum_string(&mut rng, 3)
    )
}

/// Deterministic message-id for `message_id_format = ngx`, derived from the
/// file's nxg header, part type, and part number — stable across retries so
/// a partial repost never changes an article's identity.
pub fn generate_message_id_ngx(nxg: &str, part_type: PartType, part_number: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nxg.as_bytes());
    hasher.update(match part_type {
        PartType::Data => b"data" as &[u8],
        PartType::Par2 => b"par2",
    });
    hasher.update(part_number.to_be_bytes());
    let digest = hasher.finalize();

    let to_alnum = |bytes: &[u8], len: usize| -> String {
        bytes
            .iter()
            .cycle()
            .take(len)
            .map(|b| ALNUM[*b as usize % ALNUM.len()] as char)
            .collect()
    };

    format!(
        "<{}@{}.{}>",
        to_alnum(&digest[0..16], 32),
        to_alnum(&digest[16..24], 8),
        to_alnum(&digest[24..28], 3)
    )
}

/// `<14-alnum> <<14-alnum>@<5-alnum>.<3-alnum>>`
pub fn generate_from() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{} <{}@{}.{}>",
        random_alnum_string(&mut rng, 14),
        random_alnum_string(&mut rng, 14),
        random_alnum_string(&mut rng, 5),
        random_alnum_string(&mut rng, 3)
    )
}

/// `[f/F] "name" - yEnc (p/P)`
pub fn generate_subject(file_no: u32, total_files: u32, name: &str, part: u32, parts: u32) -> String {
    format!("[{file_no}/{total_files}] \"{name}\" - yEnc ({part}/{parts})")
}

/// 32 random alnum characters, used as a subject when `obfuscation_policy = full`
pub fn generate_random_subject() -> String {
    random_alnum_string(&mut rand::thread_rng(), 32)
}

/// 32 random alnum characters, used as a filename when `obfuscation_policy = full`
pub fn generate_random_filename() -> String {
    random_alnum_string(&mut rand::thread_rng(), 32)
}

/// Uniform in `[now-6h, now]`. Uses a non-cryptographic PRNG per §9 — this
/// value need not be unpredictable, only plausible.
pub fn random_date_within_last_6_hours() -> DateTime<Utc> {
    let now = Utc::now();
    let offset_secs = rand::thread_rng().gen_range(0..=6 * 3600);
    now - ChronoDuration::seconds(offset_secs)
}

/// Inputs required to build one [`Article`] descriptor without reading file
/// bytes (§4.1 `BuildArticle`).
pub struct ArticleParams {
    pub file_no: u32,
    pub total_files: u32,
    pub original_name: String,
    pub part_number: u32,
    pub total_parts: u32,
    pub file_size: u64,
    pub offset: u64,
    pub part_size: u64,
    pub newsgroups: Vec<String>,
    pub part_type: PartType,
    pub obfuscation_policy: ObfuscationPolicy,
    pub message_id_format: MessageIdFormat,
    pub nxg_header: Option<String>,
    pub add_ngx_header: bool,
    pub custom_headers: HashMap<String, String>,
    pub default_from: Option<String>,
}

/// Constructs an [`Article`] descriptor, applying the selected obfuscation
/// policy to subject/filename/date/from (§4.1).
pub fn build_article(params: ArticleParams) -> Result<Article> {
    let real_subject = generate_subject(
        params.file_no,
        params.total_files,
        &params.original_name,
        params.part_number,
        params.total_parts,
    );

    let (subject, file_name, date, from) = match params.obfuscation_policy {
        ObfuscationPolicy::None => {
            let from = params
                .default_from
                .clone()
                .unwrap_or_else(generate_from);
            (real_subject, params.original_name.clone(), Utc::now(), from)
        }
        ObfuscationPolicy::Partial => {
            let subject = format!("{:x}", md5::compute(real_subject.as_bytes()));
            let file_name = format!(
                "{:x}",
                md5::compute(format!("{}{}", params.original_name, params.part_number).as_bytes())
            );
            let from = params
                .default_from
                .clone()
                .unwrap_or_else(generate_from);
            (subject, file_name, Utc::now(), from)
        }
        ObfuscationPolicy::Full => {
            let subject = generate_random_subject();
            let file_name = generate_random_filename();
            let date = random_date_within_last_6_hours();
            let from = generate_from();
            (subject, file_name, date, from)
        }
    };

    let message_id = match params.message_id_format {
        MessageIdFormat::Random => generate_message_id(),
        MessageIdFormat::Ngx => {
            let nxg = params.nxg_header.as_deref().ok_or_else(|| {
                Error::Post(PostError::Encoding(
                    "ngx message-id format requires an nxg header".to_string(),
                ))
            })?;
            generate_message_id_ngx(nxg, params.part_type, params.part_number)
        }
    };

    let x_nxg = if params.add_ngx_header {
        params.nxg_header.clone()
    } else {
        None
    };

    Ok(Article {
        message_id,
        subject,
        from,
        newsgroups: params.newsgroups,
        part_number: params.part_number,
        total_parts: params.total_parts,
        file_name,
        original_name: params.original_name,
        file_size: params.file_size,
        offset: params.offset,
        part_size: params.part_size,
        date,
        x_nxg,
        custom_headers: params.custom_headers,
        content_hash: None,
        part_type: params.part_type,
    })
}

/// Headers that custom headers must never shadow (§6 NNTP wire framing).
const MANDATORY_HEADERS: [&str; 5] = ["subject", "from", "newsgroups", "message-id", "date"];

fn yenc_encode_body(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / YENC_LINE_LEN + 16);
    let mut col = 0usize;
    for (i, &b) in body.iter().enumerate() {
        let mut encoded = b.wrapping_add(42);
        let needs_escape = matches!(encoded, 0x00 | 0x0A | 0x0D | 0x3D)
            || (col == 0 && encoded == 0x2E);
        if needs_escape {
            out.push(b'=');
            encoded = encoded.wrapping_add(64);
            col += 1;
        }
        out.push(encoded);
        col += 1;
        if col >= YENC_LINE_LEN && i + 1 < body.len() {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    out
}

/// Assembles headers, yEnc-encodes `body`, and appends the `=yend` footer
/// with the CRC32 of the *original* body (§4.1 `Encode`, §6 wire framing).
pub fn encode(article: &Article, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() as u64 != article.part_size {
        return Err(Error::Post(PostError::Encoding(format!(
            "body length {} does not match article part_size {}",
            body.len(),
            article.part_size
        ))));
    }

    let crc = crc32fast::hash(body);
    let mut wire = Vec::with_capacity(body.len() * 2 + 256);

    wire.extend_from_slice(format!("Subject: {}\r\n", article.subject).as_bytes());
    wire.extend_from_slice(format!("From: {}\r\n", article.from).as_bytes());
    wire.extend_from_slice(format!("Newsgroups: {}\r\n", article.newsgroups.join(",")).as_bytes());
    wire.extend_from_slice(format!("Message-ID: {}\r\n", article.message_id).as_bytes());
    wire.extend_from_slice(
        format!("Date: {}\r\n", article.date.format("%a, %d %b %Y %H:%M:%S GMT")).as_bytes(),
    );
    if let Some(x_nxg) = &article.x_nxg {
        wire.extend_from_slice(format!("X-Nxg: {x_nxg}\r\n").as_bytes());
    }
    for (key, value) in &article.custom_headers {
        if MANDATORY_HEADERS.contains(&key.to_ascii_lowercase().as_str()) {
            continue;
        }
        wire.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
    }
    wire.extend_from_slice(b"\r\n");

    let begin = article.offset + 1;
    let end = article.offset + article.part_size;
    wire.extend_from_slice(
        format!(
            "=ybegin part={} total={} line={} size={} name={}\r\n",
            article.part_number, article.total_parts, YENC_LINE_LEN, article.file_size, article.file_name
        )
        .as_bytes(),
    );
    wire.extend_from_slice(format!("=ypart begin={begin} end={end}\r\n").as_bytes());
    wire.extend_from_slice(&yenc_encode_body(body));
    wire.extend_from_slice(
        format!(
            "\r\n=yend size={} part={} pcrc32={:08X}\r\n",
            body.len(),
            article.part_number,
            crc
        )
        .as_bytes(),
    );

    Ok(wire)
}

/// SHA-256 content hash of a part, filled into [`Article::content_hash`]
/// after the bytes are read (§3).
pub fn content_hash(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn message_id_matches_expected_shape() {
        let re = Regex::new(r"^<[A-Za-z0-9]{32}@[A-Za-z0-9]{8}\.[A-Za-z0-9]{3}>$").unwrap();
        for _ in 0..50 {
            assert!(re.is_match(&generate_message_id()));
        }
    }

    #[test]
    fn from_matches_expected_shape() {
        let re =
            Regex::new(r"^[A-Za-z0-9]{14} <[A-Za-z0-9]{14}@[A-Za-z0-9]{5}\.[A-Za-z0-9]{3}>$")
                .unwrap();
        for _ in 0..50 {
            assert!(re.is_match(&generate_from()));
        }
    }

    #[test]
    fn ngx_message_id_is_deterministic() {
        let a = generate_message_id_ngx("nxg-1", PartType::Data, 3);
        let b = generate_message_id_ngx("nxg-1", PartType::Data, 3);
        assert_eq!(a, b);
        let c = generate_message_id_ngx("nxg-1", PartType::Data, 4);
        assert_ne!(a, c);
    }

    #[test]
    fn random_date_is_within_six_hours() {
        let now = Utc::now();
        for _ in 0..20 {
            let d = random_date_within_last_6_hours();
            assert!(d <= now);
            assert!(now - d <= ChronoDuration::hours(6));
        }
    }

    fn sample_article(obfuscation_policy: ObfuscationPolicy) -> Article {
        build_article(ArticleParams {
            file_no: 1,
            total_files: 1,
            original_name: "movie.mkv".to_string(),
            part_number: 1,
            total_parts: 3,
            file_size: 2_250_000,
            offset: 0,
            part_size: 750_000,
            newsgroups: vec!["alt.binaries.test".to_string()],
            part_type: PartType::Data,
            obfuscation_policy,
            message_id_format: MessageIdFormat::Random,
            nxg_header: None,
            add_ngx_header: false,
            custom_headers: HashMap::new(),
            default_from: None,
        })
        .unwrap()
    }

    #[test]
    fn none_policy_keeps_real_subject_and_filename() {
        let article = sample_article(ObfuscationPolicy::None);
        assert_eq!(article.file_name, "movie.mkv");
        assert!(article.subject.contains("movie.mkv"));
    }

    #[test]
    fn partial_policy_hashes_subject_and_filename() {
        let article = sample_article(ObfuscationPolicy::Partial);
        assert_eq!(article.file_name.len(), 32);
        assert_eq!(article.subject.len(), 32);
    }

    #[test]
    fn full_policy_randomizes_everything() {
        let a = sample_article(ObfuscationPolicy::Full);
        let b = sample_article(ObfuscationPolicy::Full);
        assert_ne!(a.subject, b.subject);
        assert_ne!(a.file_name, b.file_name);
        assert_ne!(a.from, b.from);
    }

    #[test]
    fn encode_footer_matches_crc_and_size() {
        let article = sample_article(ObfuscationPolicy::None);
        let body: Vec<u8> = (0..750_000u32).map(|i| (i % 256) as u8).collect();
        let wire = encode(&article, &body).unwrap();
        let wire_str = String::from_utf8_lossy(&wire);
        let crc = crc32fast::hash(&body);
        assert!(wire_str.contains(&format!("pcrc32={crc:08X}")));
        assert!(wire_str.contains(&format!("size={}", body.len())));
    }

    #[test]
    fn encode_rejects_mismatched_body_length() {
        let article = sample_article(ObfuscationPolicy::None);
        let body = vec![0u8; 10];
        assert!(encode(&article, &body).is_err());
    }

    #[test]
    fn yenc_round_trips_through_nntp_rs_decoder() {
        let article = sample_article(ObfuscationPolicy::None);
        let body: Vec<u8> = (0..750_000u32).map(|i| ((i * 7) % 256) as u8).collect();
        let wire = encode(&article, &body).unwrap();

        let ybegin = wire
            .windows(8)
            .position(|w| w == b"=ybegin ")
            .expect("=ybegin marker present");
        let decoded = nntp_rs::yenc_decode(&wire[ybegin..]).expect("decodes cleanly");
        assert_eq!(decoded.data, body);
    }

    #[test]
    fn custom_headers_never_shadow_mandatory_headers() {
        let mut article = sample_article(ObfuscationPolicy::None);
        article
            .custom_headers
            .insert("Subject".to_string(), "forged".to_string());
        let body = vec![0u8; 750_000];
        let wire = encode(&article, &body).unwrap();
        let wire_str = String::from_utf8_lossy(&wire);
        assert_eq!(wire_str.matches("Subject:").count(), 1);
    }
}
