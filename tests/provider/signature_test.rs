//! Signature validator tests against the reference algorithm.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use matrix_sms_bridge::provider::signature::{RequestBody, RequestValidator};
use sha2::{Digest, Sha256};
use url::Url;

fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn sign(validator: &RequestValidator, url: &Url, form: &[(String, String)]) -> String {
    BASE64.encode(validator.compute(url, form))
}

#[test]
fn accepts_reference_signature() {
    let validator = RequestValidator::new("shared-secret");
    let url = Url::parse("https://bridge.example.com/receive").expect("valid url");
    let form = params(&[
        ("MessageSid", "SM123"),
        ("From", "whatsapp:+15551234567"),
        ("Body", "hello"),
    ]);
    let signature = sign(&validator, &url, &form);
    assert!(validator.validate(&url, &RequestBody::Form(&form), &signature));
}

#[test]
fn rejects_signature_from_different_secret() {
    let validator = RequestValidator::new("shared-secret");
    let other = RequestValidator::new("other-secret");
    let url = Url::parse("https://bridge.example.com/receive").expect("valid url");
    let form = params(&[("MessageSid", "SM123")]);
    let signature = sign(&other, &url, &form);
    assert!(!validator.validate(&url, &RequestBody::Form(&form), &signature));
}

#[test]
fn rejects_signature_over_different_params() {
    let validator = RequestValidator::new("shared-secret");
    let url = Url::parse("https://bridge.example.com/receive").expect("valid url");
    let signed_form = params(&[("MessageSid", "SM123"), ("Body", "hello")]);
    let tampered_form = params(&[("MessageSid", "SM123"), ("Body", "goodbye")]);
    let signature = sign(&validator, &url, &signed_form);
    assert!(!validator.validate(&url, &RequestBody::Form(&tampered_form), &signature));
}

#[test]
fn param_order_does_not_matter() {
    let validator = RequestValidator::new("shared-secret");
    let url = Url::parse("https://bridge.example.com/receive").expect("valid url");
    let sorted = params(&[("Alpha", "1"), ("Beta", "2")]);
    let reversed = params(&[("Beta", "2"), ("Alpha", "1")]);
    let signature = sign(&validator, &url, &sorted);
    assert!(validator.validate(&url, &RequestBody::Form(&reversed), &signature));
}

#[test]
fn url_is_normalized_before_signing() {
    let validator = RequestValidator::new("shared-secret");
    let canonical = Url::parse("https://bridge.example.com/receive?x=1").expect("valid url");
    let form = params(&[("MessageSid", "SM123")]);
    let signature = sign(&validator, &canonical, &form);

    // The provider signs the canonical https URL; the bridge may observe
    // the request through a plain-http listener with an explicit port.
    let observed = Url::parse("http://bridge.example.com:8080/receive?x=1").expect("valid url");
    assert!(validator.validate(&observed, &RequestBody::Form(&form), &signature));
}

#[test]
fn body_hash_path_requires_both_checks() {
    let validator = RequestValidator::new("shared-secret");
    let body = r#"{"hello":"world"}"#;
    let hash = format!("{:x}", Sha256::digest(body.as_bytes()));
    let url = Url::parse(&format!(
        "https://bridge.example.com/receive?bodySHA256={hash}"
    ))
    .expect("valid url");

    // Signature over the bare URL with no params appended.
    let signature = sign(&validator, &url, &[]);
    assert!(validator.validate(&url, &RequestBody::Raw(body), &signature));

    // Same signature, tampered body: the hash check must fail.
    assert!(!validator.validate(&url, &RequestBody::Raw(r#"{"hello":"mars"}"#), &signature));

    // Correct body, signature from the wrong secret.
    let other = RequestValidator::new("other-secret");
    let bad_signature = sign(&other, &url, &[]);
    assert!(!validator.validate(&url, &RequestBody::Raw(body), &bad_signature));
}

#[test]
fn undecodable_signature_is_invalid() {
    let validator = RequestValidator::new("shared-secret");
    let url = Url::parse("https://bridge.example.com/receive").expect("valid url");
    let form = params(&[("MessageSid", "SM123")]);
    assert!(!validator.validate(&url, &RequestBody::Form(&form), "%%% not base64 %%%"));
}
