use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

/// Walk getifaddrs once and fold the result per interface name.
pub fn enumerate() -> Result<Vec<Device>> {
    let mut devices: Vec<Device> = vec![];

    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();

        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(anyhow!(
                "getifaddrs: {}",
                std::io::Error::last_os_error()
            ));
        }

        let mut cursor = ifap;

        while !cursor.is_null() {
            let entry = &*cursor;

            cursor = entry.ifa_next;

            if entry.ifa_addr.is_null() {
                continue;
            }

            let addr = match (*entry.ifa_addr).sa_family as i32 {
                libc::AF_INET => {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);

                    IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
                }

                libc::AF_INET6 => {
                    let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);

                    IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
                }

                _ => continue,
            };

            let name = CStr::from_ptr(entry.ifa_name).to_string_lossy().into_owned();

            match devices.iter_mut().find(|d| d.name == name) {
                Some(device) => device.addrs.push(addr),
                None => devices.push(Device {
                    name,
                    addrs: vec![addr],
                }),
            }
        }

        libc::freeifaddrs(ifap);
    }

    Ok(devices)
}

/// Address the observer binds its raw socket to for (device, family).
pub fn local_addr(device: &str, want_v6: bool) -> Result<IpAddr> {
    let devices = enumerate()?;

    let found = devices
        .into_iter()
        .find(|d| d.name == device)
        .ok_or_else(|| anyhow!("No such device {device}"))?;

    let mut fallback = None;

    for addr in found.addrs {
        if addr.is_ipv6() != want_v6 {
            continue;
        }

        match addr {
            /* prefer a routable address over link-local scope */
            IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80 => {
                fallback.get_or_insert(addr);
            }

            addr => return Ok(addr),
        }
    }

    fallback.ok_or_else(|| {
        anyhow!(
            "Device {device} has no {} address",
            if want_v6 { "IPv6" } else { "IPv4" }
        )
    })
}
