//! Network family: per-second interface rates from `/proc/net/dev`, split
//! into intranet and extranet classes plus totals.
//!
//! Classification is by the interface's current IPv4 address: first octet
//! 10, 192 or 172 (or no address at all) counts as intranet, anything else
//! as extranet. An interface enters the table when first seen with an
//! address, or when its name starts with `eth`; the first sighting only
//! records baseline counters.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::sampler::cpu::{parse_i64, prefix_matches};
use crate::sampler::traits::FileSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NetMetric {
    IntranetFlowIn,
    IntranetFlowOut,
    IntranetPkgsIn,
    IntranetPkgsOut,
    ExtranetFlowIn,
    ExtranetFlowOut,
    ExtranetPkgsIn,
    ExtranetPkgsOut,
    TotalFlowIn,
    TotalFlowOut,
    TotalPkgsIn,
    TotalPkgsOut,
}

#[derive(Debug)]
struct IfaceState {
    ip: Option<Ipv4Addr>,
    rx_bytes: i64,
    rx_pkts: i64,
    tx_bytes: i64,
    tx_pkts: i64,
}

/// Rates for one traffic class, all per second using integer division.
#[derive(Debug, Default)]
struct ClassSlots {
    flow_in: Option<i64>,
    flow_out: Option<i64>,
    pkgs_in: Option<i64>,
    pkgs_out: Option<i64>,
}

impl ClassSlots {
    fn zero_if_unset(&mut self) {
        self.flow_in.get_or_insert(0);
        self.flow_out.get_or_insert(0);
        self.pkgs_in.get_or_insert(0);
        self.pkgs_out.get_or_insert(0);
    }

    fn add(&mut self, rx_bytes: i64, rx_pkts: i64, tx_bytes: i64, tx_pkts: i64) {
        add_to(&mut self.flow_in, rx_bytes);
        add_to(&mut self.pkgs_in, rx_pkts);
        add_to(&mut self.flow_out, tx_bytes);
        add_to(&mut self.pkgs_out, tx_pkts);
    }
}

fn add_to(slot: &mut Option<i64>, delta: i64) {
    *slot = Some(slot.unwrap_or(0) + delta);
}

#[derive(Debug, Default)]
pub(crate) struct NetFamily {
    last_time: i64,
    ifaces: HashMap<String, IfaceState>,
    intranet: ClassSlots,
    extranet: ClassSlots,
    total: ClassSlots,
}

impl NetFamily {
    pub(crate) fn sample<F: FileSystem>(
        &mut self,
        fs: &F,
        metric: NetMetric,
        interval: i64,
        now: i64,
    ) -> String {
        if self.last_time + interval <= now {
            self.refresh(fs, now);
        }

        let slot = match metric {
            NetMetric::IntranetFlowIn => &mut self.intranet.flow_in,
            NetMetric::IntranetFlowOut => &mut self.intranet.flow_out,
            NetMetric::IntranetPkgsIn => &mut self.intranet.pkgs_in,
            NetMetric::IntranetPkgsOut => &mut self.intranet.pkgs_out,
            NetMetric::ExtranetFlowIn => &mut self.extranet.flow_in,
            NetMetric::ExtranetFlowOut => &mut self.extranet.flow_out,
            NetMetric::ExtranetPkgsIn => &mut self.extranet.pkgs_in,
            NetMetric::ExtranetPkgsOut => &mut self.extranet.pkgs_out,
            NetMetric::TotalFlowIn => &mut self.total.flow_in,
            NetMetric::TotalFlowOut => &mut self.total.flow_out,
            NetMetric::TotalPkgsIn => &mut self.total.pkgs_in,
            NetMetric::TotalPkgsOut => &mut self.total.pkgs_out,
        };
        match slot.take() {
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }

    fn refresh<F: FileSystem>(&mut self, fs: &F, now: i64) {
        let content = match fs.read_to_string(Path::new("/proc/net/dev")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /proc/net/dev failed: {}", err);
                return;
            }
        };

        if self.last_time == 0 {
            self.last_time = now;
        }
        let diff_time = now - self.last_time;

        for (index, raw) in content.lines().enumerate() {
            // Two header lines precede the per-interface table.
            if index < 2 {
                continue;
            }

            let line = raw.trim();
            if prefix_matches(line, "lo:") {
                continue;
            }
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }

            let rx_bytes = parse_i64(fields[0]);
            let rx_pkts = parse_i64(fields[1]);
            let tx_bytes = parse_i64(fields[8]);
            let tx_pkts = parse_i64(fields[9]);
            let ip = fs.interface_ipv4(name);

            match self.ifaces.get_mut(name) {
                None => {
                    if ip.is_none() && !prefix_matches(name, "eth") {
                        continue;
                    }
                    self.ifaces.insert(
                        name.to_string(),
                        IfaceState {
                            ip,
                            rx_bytes,
                            rx_pkts,
                            tx_bytes,
                            tx_pkts,
                        },
                    );
                }
                Some(state) => {
                    if diff_time <= 0 {
                        continue;
                    }

                    let avg_rx_bytes = (rx_bytes - state.rx_bytes) / diff_time;
                    let avg_rx_pkts = (rx_pkts - state.rx_pkts) / diff_time;
                    let avg_tx_bytes = (tx_bytes - state.tx_bytes) / diff_time;
                    let avg_tx_pkts = (tx_pkts - state.tx_pkts) / diff_time;

                    self.intranet.zero_if_unset();
                    self.extranet.zero_if_unset();
                    self.total.zero_if_unset();

                    if is_extranet(ip) {
                        self.extranet
                            .add(avg_rx_bytes, avg_rx_pkts, avg_tx_bytes, avg_tx_pkts);
                    } else {
                        self.intranet
                            .add(avg_rx_bytes, avg_rx_pkts, avg_tx_bytes, avg_tx_pkts);
                    }
                    self.total
                        .add(avg_rx_bytes, avg_rx_pkts, avg_tx_bytes, avg_tx_pkts);

                    if ip.is_some() {
                        state.ip = ip;
                    }
                    state.rx_bytes = rx_bytes;
                    state.rx_pkts = rx_pkts;
                    state.tx_bytes = tx_bytes;
                    state.tx_pkts = tx_pkts;
                }
            }
        }

        self.last_time = now;
    }
}

fn is_extranet(ip: Option<Ipv4Addr>) -> bool {
    match ip {
        Some(addr) => !matches!(addr.octets()[0], 10 | 192 | 172),
        None => false,
    }
}
