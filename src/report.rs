use std::fmt::Write;

use colored::{ Color, Colorize };
use comfy_table::{ presets, Attribute, Cell, Table };
use indicatif::{ ProgressBar, ProgressDrawTarget, ProgressStyle };
use tracing::warn;

use crate::{
    aggregate::{ Aggregate, UNDEFINED_SERVICE },
    scan::{ Host, PortState, ScanResult, Service },
    vuln::{ Findings, VulnerabilityReport },
};

const BAR_WIDTH: usize = 40;
const TABLE_HEADER: [&str; 8] = [
    "Port",
    "Protocol",
    "State",
    "Service",
    "Application",
    "Version",
    "CVEs",
    "Most Critical CVE",
];

/// Presentation settings handed to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub color: bool,
    pub bar_width: usize,
}

impl Default for Style {
    fn default() -> Self {
        Style { color: true, bar_width: BAR_WIDTH }
    }
}

fn table_color(state: PortState) -> Option<comfy_table::Color> {
    match state {
        PortState::Open => Some(comfy_table::Color::Green),
        PortState::Closed => Some(comfy_table::Color::Red),
        PortState::Filtered => Some(comfy_table::Color::Yellow),
        _ => None,
    }
}

// indicatif colour names
fn bar_color(state: PortState) -> &'static str {
    match state {
        PortState::Open => "green",
        PortState::Closed => "red",
        PortState::Filtered => "yellow",
        _ => "white",
    }
}

pub struct Report<'a> {
    result: &'a ScanResult,
    agg: &'a Aggregate,
    findings: &'a Findings,
    style: Style,
}

impl<'a> Report<'a> {
    pub fn new(
        result: &'a ScanResult,
        agg: &'a Aggregate,
        findings: &'a Findings,
        style: Style
    ) -> Self {
        Report { result, agg, findings, style }
    }

    fn paint(&self, text: &str, color: Color, bold: bool) -> String {
        if !self.style.color {
            return text.to_owned();
        }
        let s = text.color(color);
        if bold { s.bold().to_string() } else { s.to_string() }
    }

    fn vulns(&self, service: &Service) -> Option<&VulnerabilityReport> {
        self.findings.get(&(service.product.clone(), service.version.clone()))
    }

    pub fn summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "\n{}", self.paint("NMAP Scan Summary", Color::White, true));
        if !self.result.args.is_empty() {
            let _ = writeln!(s, "Command: {}", self.result.args);
        }
        if !self.result.start_str.is_empty() {
            let _ = writeln!(s, "Started: {}", self.result.start_str);
        }
        let hosts = format!("Total Hosts Scanned: {}", self.result.hosts.len());
        let open = format!("Total Open Ports: {}", self.agg.count(PortState::Open));
        let _ = writeln!(s, "{}", self.paint(&hosts, Color::Cyan, false));
        let _ = writeln!(s, "{}", self.paint(&open, Color::Cyan, false));
        s
    }

    /// Plain per-state lines in state order. Empty when the scan has no
    /// ports, in which case no summary is rendered at all.
    pub fn state_lines(&self) -> Vec<String> {
        let total = self.agg.total_ports();
        if total == 0 {
            return vec![];
        }
        self.agg.state_counts
            .iter()
            .map(|(state, count)| state_line(*state, *count, total))
            .collect()
    }

    /// One bar per observed state, sized against all ports. Falls back to
    /// [`Report::state_lines`] without colour or a terminal.
    fn print_state_bars(&self) {
        let lines = self.state_lines();
        if lines.is_empty() {
            return;
        }
        if !self.style.color || ProgressDrawTarget::stdout().is_hidden() {
            for line in lines {
                println!("{}", line);
            }
            return;
        }
        let total = self.agg.total_ports() as u64;
        for (state, count) in &self.agg.state_counts {
            let template = format!(
                "{{prefix:>16.cyan}} [{{bar:{}.{}}}] {{percent:>3}}% ({{pos}}/{{len}})",
                self.style.bar_width,
                bar_color(*state)
            );
            let style = match ProgressStyle::with_template(&template) {
                Ok(s) => s.progress_chars("█ "),
                Err(e) => {
                    warn!("cannot build summary bar: {}", e);
                    println!("{}", state_line(*state, *count, total as usize));
                    continue;
                }
            };
            let pb = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stdout());
            pb.set_style(style);
            pb.set_prefix(state.as_str().to_uppercase());
            pb.set_position(*count as u64);
            pb.abandon();
        }
    }

    pub fn port_table(&self, host: &Host) -> Table {
        let mut table = Table::new();
        table.load_preset(presets::ASCII_NO_BORDERS).set_header(TABLE_HEADER.to_vec());
        if self.style.color {
            table.enforce_styling();
        } else {
            table.force_no_tty();
        }
        for port in &host.ports {
            let vulns = self.vulns(&port.service);
            let count = vulns.map_or(0, VulnerabilityReport::len);
            let critical = vulns.map_or("", |v| v.critical.as_str());
            let mut state = Cell::new(port.state.as_str()).add_attribute(Attribute::Bold);
            if let Some(c) = table_color(port.state) {
                state = state.fg(c);
            }
            table.add_row(
                vec![
                    Cell::new(port.port_id),
                    Cell::new(port.protocol.as_str()),
                    state,
                    Cell::new(&port.service.name),
                    Cell::new(&port.service.product),
                    Cell::new(&port.service.version),
                    Cell::new(count),
                    Cell::new(critical)
                ]
            );
        }
        table
    }

    pub fn host_section(&self, host: &Host) -> String {
        let mut s = String::new();
        let title = format!("Details for {}", host.address());
        let _ = writeln!(s, "\n{}", self.paint(&title, Color::Magenta, true));
        for a in &host.addresses {
            let line = format!("  • {} ({})", a.addr, a.addr_type.as_str());
            let _ = writeln!(s, "{}", self.paint(&line, Color::Yellow, false));
        }
        if host.ports.is_empty() {
            let _ = writeln!(s, "  no ports reported");
        } else {
            let _ = writeln!(s, "{}", self.port_table(host));
        }
        let matches = host.os_matches();
        if !matches.is_empty() {
            let _ = writeln!(s, "\n{}", self.paint("Potential OS Detection:", Color::Cyan, false));
            for m in matches {
                let line = format!("  • {} (Accuracy: {:.2}%)", m.name, m.accuracy);
                let _ = writeln!(s, "{}", self.paint(&line, Color::Yellow, false));
            }
        }
        s
    }

    pub fn listings(&self) -> String {
        let mut s = String::new();
        for (port, addresses) in &self.agg.by_port {
            let _ = writeln!(s, "Port {} is open on the following IPs: [{}]", port, addresses.join(" "));
        }
        for (service, addresses) in &self.agg.by_service {
            if service == UNDEFINED_SERVICE {
                let _ = writeln!(
                    s,
                    "{} is running on the following IPs: [{}]",
                    UNDEFINED_SERVICE,
                    addresses.join(" ")
                );
            } else {
                let _ = writeln!(
                    s,
                    "Service {} is running on the following IPs: [{}]",
                    service,
                    addresses.join(" ")
                );
            }
        }
        s
    }

    pub fn print(&self) {
        print!("{}", self.summary());
        self.print_state_bars();
        println!("\nPort/Service Details");
        for host in &self.result.hosts {
            print!("{}", self.host_section(host));
        }
        println!();
        print!("{}", self.listings());
    }
}

fn state_line(state: PortState, count: usize, total: usize) -> String {
    let percent = (count * 100) / total.max(1);
    format!("{:>16} {:>3}% ({}/{})", state.as_str().to_uppercase(), percent, count, total)
}
