//! Statistics display and formatting

use coala::DeliveryInfo;
use coala_protocol::TransferReport;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a transfer rate given in bytes per second
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    let minutes = secs / 60;
    let seconds = secs % 60;
    if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{:.2}s", duration.as_secs_f64())
    }
}

/// One-line summary of a block-wise transfer
pub fn format_transfer(report: &TransferReport) -> String {
    let direction = if report.incoming { "received" } else { "sent" };
    let mut line = format!(
        "{} {} in {} blocks, {} resends",
        direction,
        format_bytes(report.data_size as u64),
        report.messages,
        report.resends
    );
    if let Some(elapsed) = report.elapsed {
        line.push_str(&format!(", took {}", format_duration(elapsed)));
    }
    if let Some(speed) = report.speed {
        line.push_str(&format!(" ({})", format_speed(speed)));
    }
    if let Some(loss) = report.loss_percent {
        line.push_str(&format!(", loss {:.1}%", loss));
    }
    line
}

/// Print delivery telemetry of one exchange
pub fn display_delivery(info: &DeliveryInfo) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ DELIVERY                                                    │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Attempts: {} direct / {} via proxy",
        info.direct_attempts, info.via_proxy_attempts
    );
    println!(
        "│ Retransmits: {} ({:.1}%)",
        info.retransmits,
        info.retransmit_percent()
    );
    if let Some(report) = &info.transfer {
        println!("│ Transfer: {}", format_transfer(report));
    }
    println!("└─────────────────────────────────────────────────────────────┘");
}
