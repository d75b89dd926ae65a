use std::net::{IpAddr, Ipv4Addr};

const POOLSYNC_PORT: &str = "POOLSYNC_PORT";

const DEFAULT_PORT: u16 = 8080;

pub fn get_default_port() -> u16 {
    DEFAULT_PORT
}

pub fn get_port() -> Option<u16> {
    std::env::var(POOLSYNC_PORT)
        .ok()
        .and_then(|port| port.parse().ok())
}

const POOLSYNC_ADDR: &str = "POOLSYNC_ADDR";

const DEFAULT_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));

pub fn get_default_addr() -> IpAddr {
    DEFAULT_ADDR
}

pub fn get_addr() -> Option<IpAddr> {
    std::env::var(POOLSYNC_ADDR)
        .ok()
        .and_then(|addr| addr.parse().ok())
}

const POOLSYNC_TOKEN: &str = "POOLSYNC_TOKEN";

pub fn get_token() -> Option<String> {
    std::env::var(POOLSYNC_TOKEN)
        .ok()
        .filter(|token| !token.is_empty())
}
