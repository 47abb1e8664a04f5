use rand::Rng;

/// Generate a random Request Authenticator (16 bytes) per RFC 2865 Section 3
pub fn generate_request_authenticator() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut authenticator = [0u8; 16];
    rng.fill(&mut authenticator);
    authenticator
}

/// Sign a reply in place per RFC 2865 Section 3.
///
/// Writes `MD5(code | id | length | req_authenticator | attributes | secret)`
/// into the authenticator field. The caller must have placed the request's
/// authenticator at offset 4 before calling.
pub fn sign_response(frame: &mut [u8], secret: &[u8]) {
    let mut ctx = md5::Context::new();
    ctx.consume(&frame[..]);
    ctx.consume(secret);
    let digest = ctx.compute();
    frame[4..20].copy_from_slice(&digest.0);
}

/// Validate the Response Authenticator of a received reply.
///
/// Accepts iff `MD5(code | id | length | req_authenticator | attributes |
/// secret)` equals the authenticator carried in the frame.
pub fn verify_response(frame: &[u8], request_authenticator: &[u8; 16], secret: &[u8]) -> bool {
    let mut ctx = md5::Context::new();
    ctx.consume(&frame[..4]);
    ctx.consume(request_authenticator);
    ctx.consume(&frame[20..]);
    ctx.consume(secret);
    let digest = ctx.compute();
    digest.0 == frame[4..20]
}
