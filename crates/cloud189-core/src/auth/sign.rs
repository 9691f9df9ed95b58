//! Per-request signing.
//!
//! Every request carries the client identification parameters. Requests made
//! with a session additionally carry
//! `Signature = HMAC-SHA1(SessionKey=..&Operate=..&RequestURI=..&Date=.., secret)`.
//!
//! The upload service takes its arguments as one `params` value, AES-128-ECB
//! encrypted with the session secret, and signs that value as well.

use std::sync::Arc;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{self, HeaderName, HeaderValue};
use reqwest::{Request, Url};
use sha1::Sha1;
use tracing::{trace, warn};

use crate::api::Prepare;
use crate::config::ConfigStore;

type HmacSha1 = Hmac<Sha1>;

pub const CLIENT_TYPE: &str = "TELEPC";
pub const CLIENT_VERSION: &str = "7.1.8.0";
pub const CHANNEL_ID: &str = "web_cloud.189.cn";

/// The upload service signs its `params` blob as well.
pub const UPLOAD_HOST: &str = "upload.cloud.189.cn";

const USER_AGENT: &str = "desktop";

/// Query keys owned by the signer.
const CLIENT_PARAM_KEYS: [&str; 4] = ["rand", "clientType", "version", "channelId"];

/// Query key of the encrypted upload arguments.
const UPLOAD_PARAMS_KEY: &str = "params";

const AES_BLOCK_SIZE: usize = 16;

const SESSION_KEY_HEADER: HeaderName = HeaderName::from_static("sessionkey");
const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("signature");
const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Signs outgoing requests with the current session of a [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct Signer {
    store: Arc<ConfigStore>,
    upload_host: String,
    /// `None` matches the upload host on any port.
    upload_port: Option<u16>,
}

impl Signer {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            upload_host: UPLOAD_HOST.to_string(),
            upload_port: None,
        }
    }

    /// Treat requests to the origin of `upload_url` as upload requests.
    pub fn with_upload_url(store: Arc<ConfigStore>, upload_url: &Url) -> Self {
        Self {
            store,
            upload_host: upload_url.host_str().unwrap_or(UPLOAD_HOST).to_string(),
            upload_port: upload_url.port_or_known_default(),
        }
    }

    fn is_upload(&self, url: &Url) -> bool {
        url.host_str() == Some(self.upload_host.as_str())
            && (self.upload_port.is_none() || url.port_or_known_default() == self.upload_port)
    }

    /// Sign `request` as if it were sent at `now`.
    pub fn sign_at(&self, request: &mut Request, now: DateTime<Utc>) {
        set_client_params(request.url_mut(), now.timestamp_millis());

        let session = self.store.session();
        if session.is_empty() {
            trace!(path = request.url().path(), "No session, sending unsigned");
            return;
        }

        let upload_params = if self.is_upload(request.url()) {
            Some(seal_upload_params(request.url_mut(), &session.secret))
        } else {
            None
        };

        let date = http_date(now);
        let canonical = canonical_string(
            &session.key,
            request.method().as_str(),
            request.url().path(),
            &date,
            upload_params.as_deref(),
        );
        let Some(signature) = signature(&canonical, &session.secret) else {
            warn!("Session secret rejected as HMAC key, sending unsigned");
            return;
        };

        let headers = request.headers_mut();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        insert_header(headers, header::DATE, &date);
        insert_header(headers, SESSION_KEY_HEADER, &session.key);
        insert_header(headers, SIGNATURE_HEADER, &signature);
        insert_header(headers, REQUEST_ID_HEADER, &uuid::Uuid::new_v4().to_string());
    }
}

impl Prepare for Signer {
    fn prepare(&self, request: &mut Request) {
        self.sign_at(request, Utc::now());
    }
}

/// RFC 1123 date, e.g. `Mon, 02 Jan 2006 15:04:05 GMT`.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn canonical_string(
    session_key: &str,
    method: &str,
    path: &str,
    date: &str,
    upload_params: Option<&str>,
) -> String {
    let mut data = format!(
        "SessionKey={}&Operate={}&RequestURI={}&Date={}",
        session_key, method, path, date
    );
    if let Some(params) = upload_params {
        data.push_str("&params=");
        data.push_str(params);
    }
    data
}

/// Upper-case hex HMAC-SHA1 of `data` keyed with the session secret.
pub fn signature(data: &str, secret: &str) -> Option<String> {
    let mut mac = match <HmacSha1 as Mac>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return None,
    };
    mac.update(data.as_bytes());
    Some(hex::encode_upper(mac.finalize().into_bytes()))
}

/// AES-128-ECB with PKCS#7 padding, keyed with the first 16 bytes of the
/// session secret; lower-case hex.
pub fn encrypt_params(form: &str, secret: &str) -> Option<String> {
    let key = secret.as_bytes().get(..AES_BLOCK_SIZE)?;
    let cipher = Aes128::new_from_slice(key).ok()?;

    let mut buf = form.as_bytes().to_vec();
    let pad = AES_BLOCK_SIZE - buf.len() % AES_BLOCK_SIZE;
    buf.resize(buf.len() + pad, pad as u8);
    for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Some(hex::encode(buf))
}

/// Fold the plain arguments of an upload request into an encrypted `params`
/// value and return the value to sign.
///
/// A request that already carries only `params` is signed as is.
fn seal_upload_params(url: &mut Url, secret: &str) -> String {
    let mut sealed = None;
    let mut client = Vec::new();
    let mut plain = Vec::new();
    for (k, v) in url.query_pairs() {
        if k == UPLOAD_PARAMS_KEY {
            sealed = Some(v.into_owned());
        } else if CLIENT_PARAM_KEYS.contains(&k.as_ref()) {
            client.push((k.into_owned(), v.into_owned()));
        } else {
            plain.push((k.into_owned(), v.into_owned()));
        }
    }

    if plain.is_empty() {
        return sealed.unwrap_or_default();
    }

    let form = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(&plain)
        .finish();
    let Some(blob) = encrypt_params(&form, secret) else {
        warn!("Session secret too short to encrypt upload parameters");
        return sealed.unwrap_or_default();
    };

    url.query_pairs_mut()
        .clear()
        .extend_pairs(client)
        .append_pair(UPLOAD_PARAMS_KEY, &blob);
    blob
}

/// Replace the client identification parameters, keeping everything else.
fn set_client_params(url: &mut Url, now_ms: i64) {
    let values = [
        now_ms.to_string(),
        CLIENT_TYPE.to_string(),
        CLIENT_VERSION.to_string(),
        CHANNEL_ID.to_string(),
    ];
    let fixed = CLIENT_PARAM_KEYS.iter().copied().zip(values);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !CLIENT_PARAM_KEYS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .extend_pairs(fixed);
}

fn insert_header(headers: &mut header::HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Header value not representable, skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::config::Config;
    use chrono::TimeZone;
    use reqwest::Method;

    const FIXED_DATE: &str = "Mon, 02 Jan 2006 15:04:05 MST";

    fn signer(key: &str, secret: &str) -> Signer {
        let config = Config {
            session: Session {
                key: key.into(),
                secret: secret.into(),
                ..Default::default()
            },
            ..Default::default()
        };
        Signer::new(Arc::new(ConfigStore::in_memory(config)))
    }

    fn request(method: Method, url: &str) -> Request {
        Request::new(method, Url::parse(url).unwrap())
    }

    fn query(request: &Request, key: &str) -> Option<String> {
        request
            .url()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap()
    }

    #[test]
    fn test_known_signature() {
        let data = canonical_string("K1", "GET", "/foo", FIXED_DATE, None);
        assert_eq!(
            data,
            "SessionKey=K1&Operate=GET&RequestURI=/foo&Date=Mon, 02 Jan 2006 15:04:05 MST"
        );
        assert_eq!(signature(&data, "S1").as_deref(), Some("F8F310967EE7A7BE826299C5DD2230CE692EB1E4"));
        assert_eq!(signature(&data, "S2").as_deref(), Some("9A5A654001701A067471953D421D8670F48C9816"));
    }

    #[test]
    fn test_signature_binds_every_input() {
        let base = signature(&canonical_string("K1", "GET", "/foo", FIXED_DATE, None), "S1");
        let variants = [
            canonical_string("K2", "GET", "/foo", FIXED_DATE, None),
            canonical_string("K1", "POST", "/foo", FIXED_DATE, None),
            canonical_string("K1", "GET", "/bar", FIXED_DATE, None),
            canonical_string("K1", "GET", "/foo", "Tue, 03 Jan 2006 15:04:05 MST", None),
            canonical_string("K1", "GET", "/foo", FIXED_DATE, Some("")),
        ];
        for data in variants {
            assert_ne!(signature(&data, "S1"), base, "{data}");
        }
        assert_eq!(
            signature(&canonical_string("K1", "GET", "/foo", FIXED_DATE, None), "S1"),
            base
        );
    }

    #[test]
    fn test_empty_session_sends_client_params_only() {
        let mut req = request(Method::GET, "https://api.cloud.189.cn/getUserInfo.action");
        signer("", "").sign_at(&mut req, fixed_now());

        assert_eq!(query(&req, "clientType").as_deref(), Some(CLIENT_TYPE));
        assert_eq!(query(&req, "version").as_deref(), Some(CLIENT_VERSION));
        assert_eq!(query(&req, "channelId").as_deref(), Some(CHANNEL_ID));
        assert_eq!(query(&req, "rand"), Some(fixed_now().timestamp_millis().to_string()));
        assert!(req.headers().get("signature").is_none());
        assert!(req.headers().get("sessionkey").is_none());
    }

    #[test]
    fn test_signed_request_headers() {
        let mut req = request(Method::GET, "https://api.cloud.189.cn/foo?folderId=-11&rand=1");
        signer("K1", "S1").sign_at(&mut req, fixed_now());

        let date = "Mon, 02 Jan 2006 15:04:05 GMT";
        let expected = signature(&canonical_string("K1", "GET", "/foo", date, None), "S1").unwrap();
        let headers = req.headers();
        assert_eq!(headers["date"], date);
        assert_eq!(headers["sessionkey"], "K1");
        assert_eq!(headers["signature"], expected.as_str());
        assert_eq!(headers["user-agent"], "desktop");
        assert_eq!(headers["x-request-id"].len(), 36);

        assert_eq!(query(&req, "folderId").as_deref(), Some("-11"));
        let rands = req.url().query_pairs().filter(|(k, _)| k == "rand").count();
        assert_eq!(rands, 1);
    }

    #[test]
    fn test_upload_host_signs_params() {
        let url = "https://upload.cloud.189.cn/person/initMultiUpload?params=abc";
        let mut req = request(Method::PUT, url);
        signer("K1", "S1").sign_at(&mut req, fixed_now());

        let date = http_date(fixed_now());
        let expected = signature(
            &canonical_string("K1", "PUT", "/person/initMultiUpload", &date, Some("abc")),
            "S1",
        )
        .unwrap();
        assert_eq!(req.headers()["signature"], expected.as_str());

        let mut plain = request(Method::PUT, "https://api.cloud.189.cn/person/initMultiUpload?params=abc");
        signer("K1", "S1").sign_at(&mut plain, fixed_now());
        assert_ne!(plain.headers()["signature"], expected.as_str());
    }

    #[test]
    fn test_signature_accepts_any_secret_length() {
        assert!(signature("data", "").is_some());
        assert!(signature("data", &"s".repeat(200)).is_some());
    }

    #[test]
    fn test_encrypt_params_known_vector() {
        let blob = encrypt_params("fileName=a.txt&fileSize=5", "0123456789ABCDEFXYZ");
        assert_eq!(
            blob.as_deref(),
            Some("c29c6a5459491abd4fafd9ffa99b990996a661e2815c7639cf291867d8d3765d")
        );
        assert!(encrypt_params("fileName=a.txt", "short").is_none());
    }

    #[test]
    fn test_upload_arguments_are_sealed_and_signed() {
        let secret = "0123456789ABCDEFXYZ";
        let url = "https://upload.cloud.189.cn/person/initMultiUpload?fileName=a.txt&fileSize=5";
        let mut req = request(Method::GET, url);
        signer("K1", secret).sign_at(&mut req, fixed_now());

        let blob = "c29c6a5459491abd4fafd9ffa99b990996a661e2815c7639cf291867d8d3765d";
        assert_eq!(query(&req, "params").as_deref(), Some(blob));
        assert!(query(&req, "fileName").is_none());
        assert_eq!(query(&req, "clientType").as_deref(), Some(CLIENT_TYPE));

        let expected = signature(
            &canonical_string(
                "K1",
                "GET",
                "/person/initMultiUpload",
                &http_date(fixed_now()),
                Some(blob),
            ),
            secret,
        )
        .unwrap();
        assert_eq!(req.headers()["signature"], expected.as_str());
    }

    #[test]
    fn test_upload_origin_matches_host_and_port() {
        let store = Arc::new(ConfigStore::in_memory(Config::default()));
        let upload = Url::parse("http://127.0.0.1:9001").unwrap();
        let signer = Signer::with_upload_url(store, &upload);

        assert!(signer.is_upload(&Url::parse("http://127.0.0.1:9001/person/x").unwrap()));
        assert!(!signer.is_upload(&Url::parse("http://127.0.0.1:9002/person/x").unwrap()));
        assert!(!signer.is_upload(&Url::parse("https://api.cloud.189.cn/person/x").unwrap()));
    }
}
