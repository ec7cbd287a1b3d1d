use nfs_discover_rs::netdetect::{host_addresses, private_networks, LocalInterface};
use nfs_discover_rs::types::NetworkPrefix;
use std::net::Ipv4Addr;

#[test]
fn private_networks_are_24s_of_private_addresses() {
    let ifaces = vec![
        LocalInterface::new("eth0", Ipv4Addr::new(192, 168, 42, 99)),
        LocalInterface::new("eth1", Ipv4Addr::new(8, 8, 8, 8)),
        LocalInterface::new("veth3f2", Ipv4Addr::new(10, 200, 0, 2)),
        LocalInterface::new("wg0", Ipv4Addr::new(172, 20, 1, 1)),
    ];
    assert_eq!(
        private_networks(&ifaces),
        vec![NetworkPrefix::new(192, 168, 42), NetworkPrefix::new(172, 20, 1)]
    );
}

#[test]
fn host_addresses_exclude_network_and_broadcast() {
    let hosts = host_addresses(NetworkPrefix::new(10, 0, 0));
    assert_eq!(hosts.len(), 254);
    assert_eq!(hosts.first(), Some(&Ipv4Addr::new(10, 0, 0, 1)));
    assert_eq!(hosts.last(), Some(&Ipv4Addr::new(10, 0, 0, 254)));
}
