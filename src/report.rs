//! Human-readable rendering of a run outcome.

use std::fmt::Write;

use crate::arp::ArpOutcome;
use crate::evaluate::{Diagnosis, Verdict};
use crate::orchestrator::RunReport;

/// Format `n` with thousands separators: `1234567` -> `1,234,567`.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn status_line(report: &RunReport) -> String {
    let r = &report.result;
    match (r.verdict, r.loss_percent()) {
        (Verdict::Pass, _) if r.lost_packets == 0 => "STATUS: PASS (no loss)".to_string(),
        (Verdict::Pass, _) => "STATUS: PASS (no significant loss)".to_string(),
        (Verdict::Fail, Some(pct)) => format!("STATUS: FAIL (packet loss {:.4}%)", pct),
        (Verdict::Fail, None) => "STATUS: FAIL".to_string(),
        (Verdict::Inconclusive, _) => "STATUS: INCONCLUSIVE (no traffic transmitted)".to_string(),
    }
}

/// Operator hints for the diagnosis attached to the result.
pub fn hints(report: &RunReport) -> Vec<String> {
    let route = &report.route;
    match report.result.diagnosis {
        Some(Diagnosis::NearTotalLoss) => vec![
            "Near-total loss: likely router/ARP misconfiguration rather than congestion.".to_string(),
            format!(
                "Check the router has an ARP entry for next hop {} -> {}.",
                route.receiver.local_ip, route.receiver.hw_mac
            ),
            format!(
                "Check cabling is not swapped ({} must face {}, {} must face {}).",
                route.sender.port, route.sender.peer_ip, route.receiver.port, route.receiver.peer_ip
            ),
            format!(
                "Check the router routes the flow destination via {}.",
                route.receiver.local_ip
            ),
        ],
        Some(Diagnosis::NoTraffic) => vec![format!(
            "Nothing left {}: check the stream was programmed and the port link is up.",
            route.sender.port
        )],
        None => Vec::new(),
    }
}

/// Format a run report as a multi-line summary.
pub fn format_summary(report: &RunReport) -> String {
    let r = &report.result;
    let route = &report.route;
    let mut out = String::new();

    let _ = writeln!(out, "--- TEST RESULTS (run {}) ---", report.run_id);
    let _ = writeln!(
        out,
        "Path:                {} ({}) -> router {} -> {} ({})",
        route.sender.port,
        route.sender.hw_mac,
        route.egress_peer_mac,
        route.receiver.port,
        route.receiver.hw_mac
    );
    let rate = &report.rate;
    if rate.fell_back {
        let _ = writeln!(
            out,
            "Rate:                {} (requested {} rejected by hardware)",
            rate.applied, rate.requested
        );
    } else {
        let _ = writeln!(out, "Rate:                {}", rate.applied);
    }
    let _ = writeln!(out, "Duration:            {:.0}s", report.duration_secs);
    match &report.arp.outcome {
        ArpOutcome::Resolved => {
            let _ = writeln!(out, "ARP:                 resolved");
        }
        ArpOutcome::Degraded { reasons } => {
            let _ = writeln!(out, "ARP:                 DEGRADED");
            for reason in reasons {
                let _ = writeln!(out, "                     - {}", reason);
            }
        }
    }
    let _ = writeln!(
        out,
        "Tx Packets ({}):   {}",
        route.sender.port,
        group_thousands(r.tx_packets)
    );
    let _ = writeln!(
        out,
        "Rx Packets ({}):   {}",
        route.receiver.port,
        group_thousands(r.rx_packets)
    );
    let _ = writeln!(out, "Lost Packets:        {}", group_thousands(r.lost_packets));
    if let Some(pct) = r.loss_percent() {
        let _ = writeln!(out, "Loss Percentage:     {:.4}%", pct);
    }
    let _ = writeln!(
        out,
        "Threshold:           {:.4}%",
        report.loss_threshold * 100.0
    );
    let _ = writeln!(out, "{}", status_line(report));
    for hint in hints(report) {
        let _ = writeln!(out, "HINT: {}", hint);
    }
    out
}
