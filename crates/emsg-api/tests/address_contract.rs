use emsg_api::{normalize_address, Address};

#[test]
fn address_roundtrip() {
    let addr = Address::parse("alice#example.com").expect("parse");
    let encoded = serde_json::to_string(&addr).expect("serialize");
    let decoded: Address = serde_json::from_str(&encoded).expect("deserialize roundtrip");
    assert_eq!(decoded, addr);
}

#[test]
fn normalize_then_parse_is_stable() {
    for raw in ["alice#example.com", "Bob#Example.ORG", "c.d-e_f#sub.test.io"] {
        let parsed = Address::parse(raw).expect("parse");
        let renormalized = normalize_address(&normalize_address(&parsed.raw));
        assert_eq!(renormalized, normalize_address(&parsed.raw));
        assert!(Address::parse(&renormalized).is_ok());
    }
}
