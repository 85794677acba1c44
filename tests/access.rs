use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use anyhow::Result;
use parking_lot::RwLock;
use rand::Rng;

use firewall::{
    cidr::{self, Cidr, compile},
    http::{Handler, Request, Response},
    middleware::{AllowIpsOptions, DenyIpsOptions, wrap_allow_ips, wrap_deny_ips},
};

fn ok(_: Request) -> Result<Response> {
    Ok(Response::plain(200, "ok"))
}

fn allow_filter(blocks: &[&str]) -> Arc<dyn Handler> {
    wrap_allow_ips(
        Arc::new(ok),
        AllowIpsOptions {
            allow_list: Arc::new(compile(blocks.iter().copied())),
            ..Default::default()
        },
    )
}

fn deny_filter(blocks: &[&str]) -> Arc<dyn Handler> {
    wrap_deny_ips(
        Arc::new(ok),
        DenyIpsOptions {
            deny_list: Arc::new(compile(blocks.iter().copied())),
            ..Default::default()
        },
    )
}

#[test]
fn test_allow_by_remote_addr() -> Result<()> {
    let handler = allow_filter(&["10.0.0.0/8"]);

    assert_eq!(handler.call(Request::new("10.20.206.46"))?.status, 200);
    assert_eq!(handler.call(Request::new("192.1.1.1"))?.status, 403);

    Ok(())
}

#[test]
fn test_forwarded_hop_poisons_chain() -> Result<()> {
    let handler = allow_filter(&["10.0.0.0/8"]);

    let request = Request::new("10.20.206.46")
        .with_header("x-forwarded-for", "10.20.205.24,192.10.1.1");

    assert_eq!(handler.call(request)?.status, 403);

    Ok(())
}

#[test]
fn test_true_client_ip_honored() -> Result<()> {
    let handler = allow_filter(&["10.0.0.0/8"]);

    let request = Request::new("10.20.206.46").with_header("True-Client-IP", "172.16.0.9");
    assert_eq!(handler.call(request)?.status, 403);

    let request = Request::new("10.20.206.46").with_header("true-client-ip", "10.0.0.9:443");
    assert_eq!(handler.call(request)?.status, 200);

    Ok(())
}

#[test]
fn test_deny_any_hop() -> Result<()> {
    let handler = deny_filter(&["192.0.0.0/8"]);

    assert_eq!(handler.call(Request::new("10.20.205.24"))?.status, 200);

    let request = Request::new("10.20.205.24").with_header("x-forwarded-for", "192.10.1.1");
    assert_eq!(handler.call(request)?.status, 403);

    Ok(())
}

#[test]
fn test_default_allow_list_is_private_space() -> Result<()> {
    let handler = wrap_allow_ips(Arc::new(ok), AllowIpsOptions::default());

    assert_eq!(handler.call(Request::new("192.168.1.10"))?.status, 200);
    assert_eq!(handler.call(Request::new("172.16.255.1"))?.status, 200);
    assert_eq!(handler.call(Request::new("fc00::1"))?.status, 200);
    assert_eq!(handler.call(Request::new("8.8.8.8"))?.status, 403);

    Ok(())
}

#[test]
fn test_default_deny_list_is_public_space() -> Result<()> {
    let handler = wrap_deny_ips(Arc::new(ok), DenyIpsOptions::default());

    assert_eq!(handler.call(Request::new("8.8.8.8"))?.status, 403);
    assert_eq!(handler.call(Request::new("2001:db8::1"))?.status, 403);
    assert_eq!(handler.call(Request::new("10.1.2.3"))?.status, 200);
    assert_eq!(handler.call(Request::new("192.168.0.1"))?.status, 200);

    Ok(())
}

#[test]
fn test_unparseable_remote_addr_never_allowed() -> Result<()> {
    let handler = allow_filter(&["10.0.0.0/8"]);

    assert_eq!(handler.call(Request::new("not-an-address"))?.status, 403);
    assert_eq!(handler.call(Request::default())?.status, 403);

    Ok(())
}

#[test]
fn test_dynamic_rule_source_read_per_request() -> Result<()> {
    let rules = Arc::new(RwLock::new(compile(["10.0.0.0/8"])));

    let handler = wrap_allow_ips(
        Arc::new(ok),
        AllowIpsOptions {
            allow_list: rules.clone(),
            ..Default::default()
        },
    );

    assert_eq!(handler.call(Request::new("192.168.0.1"))?.status, 403);

    *rules.write() = compile(["192.168.0.0/16"]);
    assert_eq!(handler.call(Request::new("192.168.0.1"))?.status, 200);

    Ok(())
}

#[test]
fn test_exact_and_zero_prefix_self_containment() {
    let mut rng = rand::rng();

    for _ in 0..200 {
        let addr = IpAddr::V4(Ipv4Addr::from(rng.random::<u32>()));
        let other = IpAddr::V4(Ipv4Addr::from(rng.random::<u32>()));

        assert!(Cidr::host(addr).contains(addr));
        assert!(Cidr::new(addr, 0).contains(other));

        let addr = IpAddr::V6(Ipv6Addr::from(rng.random::<u128>()));
        let other = IpAddr::V6(Ipv6Addr::from(rng.random::<u128>()));

        assert!(Cidr::host(addr).contains(addr));
        assert!(Cidr::new(addr, 0).contains(other));
    }
}

#[test]
fn test_family_exclusion() {
    let mut rng = rand::rng();

    for _ in 0..200 {
        let v4 = IpAddr::V4(Ipv4Addr::from(rng.random::<u32>()));
        let v6 = IpAddr::V6(Ipv6Addr::from(rng.random::<u128>()));

        let v4_block = Cidr::new(v4, rng.random_range(0..=32));
        let v6_block = Cidr::new(v6, rng.random_range(0..=128));

        assert!(!v4_block.contains(v6));
        assert!(!v6_block.contains(v4));
    }
}

#[test]
fn test_chain_semantics_match_membership() {
    let ranges = compile(["10.0.0.0/8", "172.16.0.0/12"]);
    let mut rng = rand::rng();

    for _ in 0..200 {
        let a = IpAddr::V4(Ipv4Addr::from(rng.random::<u32>()));
        let b = IpAddr::V4(Ipv4Addr::from(rng.random::<u32>()));

        let a_in = cidr::any_contains(&ranges, a);
        let b_in = cidr::any_contains(&ranges, b);

        let chain = [a.to_string(), b.to_string()];
        let chain = chain.iter().map(String::as_str);

        assert_eq!(cidr::allowed(chain.clone(), &ranges), a_in && b_in);
        assert_eq!(cidr::denied(chain, &ranges), a_in || b_in);
    }
}

#[test]
fn test_partial_prefix_masking() {
    let block: Cidr = "172.16.0.0/12".parse().unwrap();

    assert!(block.contains("172.16.0.1".parse().unwrap()));
    assert!(block.contains("172.31.255.255".parse().unwrap()));
    assert!(!block.contains("172.32.0.0".parse().unwrap()));
    assert!(!block.contains("172.15.255.255".parse().unwrap()));

    let block: Cidr = "fc00::/7".parse().unwrap();

    assert!(block.contains("fd12:3456::1".parse().unwrap()));
    assert!(!block.contains("fe80::1".parse().unwrap()));
}
