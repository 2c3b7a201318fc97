use rand::RngCore;

/// 16 random bytes, hex-encoded: used for client identifiers.
pub fn new_client_id() -> String {
    random_hex(16)
}

/// 8 random bytes, hex-encoded: used for `ReqId` and connection ids.
pub fn new_req_id() -> String {
    random_hex(8)
}

fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_32_hex_chars() {
        let id = new_client_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn req_id_is_16_hex_chars() {
        let id = new_req_id();
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn successive_ids_differ() {
        assert_ne!(new_client_id(), new_client_id());
    }
}
