use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTotals {
    pub total: u64,
    pub idle: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemTotals {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetTotals {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Aggregate `cpu ` line of `/proc/stat`. iowait counts as idle.
pub fn parse_cpu_totals(proc_stat: &str) -> Option<CpuTotals> {
    let line = proc_stat.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<_>>()?;
    if values.len() < 4 {
        return None;
    }
    let field = |index: usize| values.get(index).copied().unwrap_or(0);
    let idle = field(3).saturating_add(field(4));
    let total = values.iter().fold(0u64, |sum, value| sum.saturating_add(*value));
    Some(CpuTotals { total, idle })
}

pub fn count_cpu_cores(proc_stat: &str) -> u32 {
    proc_stat
        .lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .map(|ch| ch.is_ascii_digit())
                .unwrap_or(false)
        })
        .count() as u32
}

/// Busy share between two samples, in percent. `None` when no time elapsed.
pub fn cpu_usage_percent(prev: CpuTotals, curr: CpuTotals) -> Option<f64> {
    let delta_total = curr.total.saturating_sub(prev.total);
    if delta_total == 0 {
        return None;
    }
    let delta_idle = curr.idle.saturating_sub(prev.idle);
    let busy = delta_total.saturating_sub(delta_idle);
    Some((busy as f64 * 100.0 / delta_total as f64).min(100.0))
}

pub fn parse_mem_totals(meminfo: &str) -> Option<MemTotals> {
    let mut total = None;
    let mut available = None;
    let mut fallback = 0u64;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or_default().trim_end_matches(':');
        let Some(value) = parts.next().and_then(|value| value.parse::<u64>().ok()) else {
            continue;
        };
        match key {
            "MemTotal" => total = Some(value),
            "MemAvailable" => available = Some(value),
            "MemFree" | "Buffers" | "Cached" => fallback = fallback.saturating_add(value),
            _ => {}
        }
    }
    Some(MemTotals {
        total_bytes: total?.saturating_mul(1024),
        available_bytes: available.unwrap_or(fallback).saturating_mul(1024),
    })
}

/// Sums every interface except loopback.
pub fn parse_net_totals(netdev: &str) -> Option<NetTotals> {
    let mut totals = NetTotals::default();
    let mut seen = false;
    for line in netdev.lines() {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        let iface = iface.trim();
        if iface.is_empty() || iface == "lo" {
            continue;
        }
        let cols: Vec<&str> = rest.split_whitespace().collect();
        if cols.len() < 9 {
            continue;
        }
        if let (Ok(rx), Ok(tx)) = (cols[0].parse::<u64>(), cols[8].parse::<u64>()) {
            totals.rx_bytes = totals.rx_bytes.saturating_add(rx);
            totals.tx_bytes = totals.tx_bytes.saturating_add(tx);
            seen = true;
        }
    }
    seen.then_some(totals)
}

pub fn parse_uptime_secs(uptime: &str) -> Option<u64> {
    uptime
        .split_whitespace()
        .next()
        .and_then(|value| value.parse::<f64>().ok())
        .map(|secs| secs as u64)
}

/// Battery temperature in sysfs is tenths of a degree Celsius.
pub fn parse_battery_temperature(raw: &str) -> Option<f64> {
    raw.trim().parse::<i32>().ok().map(|decic| decic as f64 / 10.0)
}

/// Thermal zones report millidegrees on most kernels and whole degrees on a few.
pub fn parse_thermal_celsius(raw: &str) -> Option<f64> {
    let value = raw.trim().parse::<i64>().ok()?;
    Some(if value.abs() > 1000 {
        value as f64 / 1000.0
    } else {
        value as f64
    })
}

/// `scaling_cur_freq` is in kHz.
pub fn parse_cpu_freq_mhz(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().map(|khz| khz / 1000)
}

/// `key=value` lines of a `build.prop`-style file. Comments and blank lines are skipped.
pub fn parse_prop_file(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

pub fn parse_cpuinfo_hardware(cpuinfo: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let value = value.trim();
        (key.trim() == "Hardware" && !value.is_empty()).then(|| value.to_string())
    })
}

/// `1d 2h 3m`, dropping leading zero units; under a minute reads `45s`.
pub fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = total_secs % 86_400 / 3600;
    let minutes = total_secs % 3600 / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{total_secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_totals_and_usage() {
        let stat = "cpu  100 0 50 200 10 0 0 0 0 0\ncpu0 50 0 25 100 5 0 0 0 0 0\ncpu1 50 0 25 100 5 0 0 0 0 0\nintr 1 2 3\n";
        let totals = parse_cpu_totals(stat).expect("cpu");
        assert_eq!(totals, CpuTotals { total: 360, idle: 210 });
        assert_eq!(count_cpu_cores(stat), 2);

        let prev = CpuTotals { total: 1000, idle: 700 };
        let curr = CpuTotals { total: 1100, idle: 740 };
        assert_eq!(cpu_usage_percent(prev, curr), Some(60.0));
        assert_eq!(cpu_usage_percent(curr, curr), None);
        assert_eq!(parse_cpu_totals("intr 1 2\n"), None);
    }

    #[test]
    fn meminfo_prefers_mem_available() {
        let mem = parse_mem_totals("MemTotal: 1000 kB\nMemAvailable: 250 kB\n").expect("mem");
        assert_eq!(mem.total_bytes, 1000 * 1024);
        assert_eq!(mem.available_bytes, 250 * 1024);

        let legacy =
            parse_mem_totals("MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 25 kB\n")
                .expect("mem");
        assert_eq!(legacy.available_bytes, 175 * 1024);
        assert_eq!(parse_mem_totals("Buffers: 1 kB\n"), None);
    }

    #[test]
    fn net_totals_skip_loopback() {
        let input = "Inter-|   Receive |  Transmit\n face |bytes packets|bytes\n    lo: 1 0 0 0 0 0 0 0 2 0 0 0 0 0 0 0\n  wlan0: 100 0 0 0 0 0 0 0 200 0 0 0 0 0 0 0\n rmnet0: 50 0 0 0 0 0 0 0 75 0 0 0 0 0 0 0\n";
        let net = parse_net_totals(input).expect("net");
        assert_eq!(net, NetTotals { rx_bytes: 150, tx_bytes: 275 });
        assert_eq!(parse_net_totals("    lo: 1 0 0 0 0 0 0 0 2\n"), None);
    }

    #[test]
    fn uptime_and_temperature() {
        assert_eq!(parse_uptime_secs("12345.67 54321.00\n"), Some(12345));
        assert_eq!(parse_battery_temperature("305\n"), Some(30.5));
        assert_eq!(parse_battery_temperature("n/a"), None);
    }

    #[test]
    fn thermal_and_frequency_units() {
        assert_eq!(parse_thermal_celsius("45000\n"), Some(45.0));
        assert_eq!(parse_thermal_celsius("38"), Some(38.0));
        assert_eq!(parse_thermal_celsius("hot"), None);
        assert_eq!(parse_cpu_freq_mhz("1804800\n"), Some(1804));
    }

    #[test]
    fn build_props_and_cpuinfo() {
        let props = parse_prop_file("# begin\nro.product.model=Pixel 8\n\nro.build.version.sdk = 34\n");
        assert_eq!(props.get("ro.product.model").map(String::as_str), Some("Pixel 8"));
        assert_eq!(props.get("ro.build.version.sdk").map(String::as_str), Some("34"));
        assert_eq!(props.len(), 2);

        let cpuinfo = "processor\t: 0\nHardware\t: Qualcomm Technologies, Inc SM8550\n";
        assert_eq!(
            parse_cpuinfo_hardware(cpuinfo).as_deref(),
            Some("Qualcomm Technologies, Inc SM8550")
        );
        assert_eq!(parse_cpuinfo_hardware("processor : 0\n"), None);
    }

    #[test]
    fn durations_drop_leading_zero_units() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m");
        assert_eq!(format_duration(3 * 3600 + 60), "3h 1m");
        assert_eq!(format_duration(86_400 + 7200 + 300), "1d 2h 5m");
    }
}
