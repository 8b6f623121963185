//! Statistics display and formatting

use reltp::io::LinkStats;
use reltp::TransportStats;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis >= 60_000 {
        format!("{}m {:02}s", millis / 60_000, (millis % 60_000) / 1000)
    } else if millis >= 1000 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", millis)
    }
}

/// Share of transmitted frames that were lost, in percent
pub fn loss_percent(link: &LinkStats) -> f64 {
    if link.frames_transmitted == 0 {
        return 0.0;
    }
    link.frames_lost as f64 * 100.0 / link.frames_transmitted as f64
}

/// Display the counters of one host
pub fn display_host_stats(name: &str, transport: &TransportStats, link: &LinkStats) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ {:<59} │", name);
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Packets:      {:>8} sent / {:>8} received              │",
        transport.packets_sent, transport.packets_received
    );
    println!(
        "│ Payload:      {:>10} sent / {:>10} received          │",
        format_bytes(transport.bytes_sent),
        format_bytes(transport.bytes_received)
    );
    println!(
        "│ Connections:  {:>8} opened / {:>8} closed              │",
        transport.connections_established, transport.connections_closed
    );
    println!(
        "│ Retransmits:  {:>8}   Timeouts: {:>8}                  │",
        transport.retransmissions, transport.handshake_timeouts
    );
    println!(
        "│ Dropped:      {:>8} malformed / {:>8} unroutable       │",
        transport.malformed_dropped, transport.unroutable_dropped
    );
    println!(
        "│ Requests:     {:>8} expired before accept                 │",
        transport.requests_expired
    );
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Link frames:  {:>8} out / {:>8} lost ({:>5.1}%)          │",
        link.frames_transmitted,
        link.frames_lost,
        loss_percent(link)
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

/// One-line summary for log output
pub fn compact_stats(transport: &TransportStats, link: &LinkStats) -> String {
    format!(
        "sent {} ({}) | received {} ({}) | retransmits {} | loss {:.1}%",
        transport.packets_sent,
        format_bytes(transport.bytes_sent),
        transport.packets_received,
        format_bytes(transport.bytes_received),
        transport.retransmissions,
        loss_percent(link)
    )
}
