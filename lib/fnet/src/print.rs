// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print stack state in a human-friendly manner.
//!
//! Used by hosted consumers and by integration tests when a failure
//! needs context.

use crate::engine::stack::Stack;
use crate::sys::stat::StatProvider;
use std::io::Write;
use std::string::String;
use std::string::ToString;
use tabwriter::TabWriter;

/// Print every interface of `stack`.
pub fn print_netifs(stack: &Stack) -> std::io::Result<()> {
    print_netifs_into(&mut std::io::stdout(), stack)
}

/// Print every interface of `stack`.
pub fn print_netifs_into(
    writer: &mut impl Write,
    stack: &Stack,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    let default = stack.default_netif();

    writeln!(t, "Interfaces")?;
    write_hrb(&mut t)?;
    writeln!(t, "ID\tNAME\tMTU\tPMTU6\tIPv4\tGATEWAY\tIPv6\tFLAGS")?;
    write_hr(&mut t)?;

    for n in stack.netifs() {
        let ip4 = match n.ip4_addr() {
            Some(a) => format!("{a}/{}", n.ip4_netmask().netmask_len()),
            None => "-".to_string(),
        };
        let gw = n.ip4_gateway().map_or("-".to_string(), |g| g.to_string());
        let ip6 = if n.ip6_addrs().is_empty() {
            "-".to_string()
        } else {
            n.ip6_addrs()
                .iter()
                .map(|a| format!("{}/{}", a.addr, a.prefix_len))
                .collect::<Vec<_>>()
                .join(",")
        };

        let mut flags = String::new();
        if n.is_loopback() {
            flags.push('L');
        }
        if Some(n.id()) == default {
            flags.push('D');
        }
        if n.ip4_disabled() {
            flags.push('4');
        }
        if n.ip6_disabled() {
            flags.push('6');
        }
        if flags.is_empty() {
            flags.push('-');
        }

        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{ip4}\t{gw}\t{ip6}\t{flags}",
            n.id(),
            n.name(),
            n.mtu(),
            n.pmtu6(),
        )?;
    }

    writeln!(t)?;
    t.flush()
}

/// Print the multicast memberships of `stack`.
pub fn print_mcast_into(
    writer: &mut impl Write,
    stack: &Stack,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Multicast Groups")?;
    write_hrb(&mut t)?;
    writeln!(t, "GROUP\tNETIF\tREFS")?;
    write_hr(&mut t)?;
    for (g, n, refs) in stack.mcast4_groups() {
        writeln!(t, "{g}\t{n}\t{refs}")?;
    }
    for (g, n, refs) in stack.mcast6_groups() {
        writeln!(t, "{g}\t{n}\t{refs}")?;
    }

    writeln!(t)?;
    t.flush()
}

/// Print the IP layer counters of `stack`.
pub fn print_stats(stack: &Stack) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stack)
}

/// Print the IP layer counters of `stack`, followed by the netbuf
/// pool usage.
pub fn print_stats_into(
    writer: &mut impl Write,
    stack: &Stack,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "IP Statistics")?;
    write_hrb(&mut t)?;
    writeln!(t, "COUNTER\tVALUE")?;
    write_hr(&mut t)?;

    let mut res: std::io::Result<()> = Ok(());
    stack.stats.visit(&mut |name, val| {
        if res.is_ok() {
            res = writeln!(t, "{name}\t{val}");
        }
    });
    res?;

    let pool = stack.pool();
    writeln!(t, "\nNetbuf Pool")?;
    write_hr(&mut t)?;
    writeln!(t, "capacity\t{}", pool.capacity())?;
    writeln!(t, "in_use\t{}", pool.in_use())?;
    writeln!(t, "high_water\t{}", pool.high_water())?;
    writeln!(t, "failures\t{}", pool.failures())?;

    writeln!(t)?;
    t.flush()
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
