pub mod parse;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::error::AppError;
use parse::{
    count_cpu_cores, cpu_usage_percent, format_duration, parse_battery_temperature,
    parse_cpu_freq_mhz, parse_cpu_totals, parse_cpuinfo_hardware, parse_mem_totals,
    parse_net_totals, parse_prop_file, parse_thermal_celsius, parse_uptime_secs, CpuTotals,
    NetTotals,
};

pub const MIN_INTERVAL_MS: u64 = 500;
pub const MAX_INTERVAL_MS: u64 = 10_000;
const FIRST_SAMPLE_GAP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cpu_usage_percent: f64,
    pub cpu_cores: u32,
    pub mem_total_bytes: u64,
    pub mem_available_bytes: u64,
    pub mem_used_percent: f64,
    pub battery_level: Option<u8>,
    pub battery_status: Option<String>,
    pub battery_temperature_c: Option<f64>,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub net_rx_bytes_per_sec: u64,
    pub net_tx_bytes_per_sec: u64,
    pub uptime_secs: u64,
    pub timestamp: i64,
}

/// Fast-changing readings pushed by the realtime stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStatus {
    /// Current frequency per core in MHz, 0 for offline cores.
    pub cpu_frequencies_mhz: Vec<u64>,
    pub cpu_temp_c: Option<f64>,
    pub gpu_temp_c: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub brand: String,
    pub processor: String,
    pub android_version: String,
    pub uptime_secs: u64,
    pub uptime: String,
}

pub trait StatsSource: Send + Sync {
    fn snapshot(&self) -> SystemStats;

    fn realtime(&self) -> RealtimeStatus {
        RealtimeStatus::default()
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::default()
    }
}

struct Previous {
    cpu: CpuTotals,
    net: Option<NetTotals>,
    at: Instant,
}

/// Reads telemetry straight from procfs and sysfs. Missing files leave fields zeroed.
pub struct ProcStatsSource {
    root: PathBuf,
    previous: Mutex<Option<Previous>>,
}

impl Default for ProcStatsSource {
    fn default() -> Self {
        Self::with_root("/")
    }
}

impl ProcStatsSource {
    /// `root` is prepended to every `/proc` and `/sys` path.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous: Mutex::new(None),
        }
    }

    fn read(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.root.join(relative)).ok()
    }

    fn battery_dir(&self) -> PathBuf {
        self.root.join("sys/class/power_supply/battery")
    }

    fn read_battery(&self, name: &str) -> Option<String> {
        read_trimmed(&self.battery_dir().join(name))
    }

    /// First thermal zone whose `type` contains one of `needles`.
    fn zone_temperature(&self, needles: &[&str]) -> Option<f64> {
        let entries = fs::read_dir(self.root.join("sys/class/thermal")).ok()?;
        let mut zones: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("thermal_zone"))
                    .unwrap_or(false)
            })
            .collect();
        zones.sort();
        zones.into_iter().find_map(|zone| {
            let kind = read_trimmed(&zone.join("type"))?.to_lowercase();
            if !needles.iter().any(|needle| kind.contains(needle)) {
                return None;
            }
            read_trimmed(&zone.join("temp")).and_then(|raw| parse_thermal_celsius(&raw))
        })
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl StatsSource for ProcStatsSource {
    fn snapshot(&self) -> SystemStats {
        let mut stats = SystemStats {
            timestamp: chrono::Utc::now().timestamp_millis(),
            ..SystemStats::default()
        };

        let mut previous = match self.previous.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let proc_stat = self.read("proc/stat").unwrap_or_default();
        stats.cpu_cores = count_cpu_cores(&proc_stat);
        let mut cpu = parse_cpu_totals(&proc_stat);
        if previous.is_none() && cpu.is_some() {
            // No earlier sample to diff against; take a short second one.
            std::thread::sleep(FIRST_SAMPLE_GAP);
            let first = cpu;
            cpu = self.read("proc/stat").and_then(|text| parse_cpu_totals(&text));
            if let (Some(first), Some(second)) = (first, cpu) {
                stats.cpu_usage_percent = cpu_usage_percent(first, second).unwrap_or(0.0);
            }
        } else if let (Some(prev), Some(curr)) = (previous.as_ref(), cpu) {
            stats.cpu_usage_percent = cpu_usage_percent(prev.cpu, curr).unwrap_or(0.0);
        }

        if let Some(mem) = self.read("proc/meminfo").and_then(|text| parse_mem_totals(&text)) {
            stats.mem_total_bytes = mem.total_bytes;
            stats.mem_available_bytes = mem.available_bytes;
            if mem.total_bytes > 0 {
                let used = mem.total_bytes.saturating_sub(mem.available_bytes);
                stats.mem_used_percent = used as f64 * 100.0 / mem.total_bytes as f64;
            }
        }

        let now = Instant::now();
        let net = self.read("proc/net/dev").and_then(|text| parse_net_totals(&text));
        if let Some(net) = net {
            stats.net_rx_bytes = net.rx_bytes;
            stats.net_tx_bytes = net.tx_bytes;
            if let Some((prev_net, prev_at)) = previous
                .as_ref()
                .and_then(|prev| prev.net.map(|value| (value, prev.at)))
            {
                let elapsed_ms = now.duration_since(prev_at).as_millis().max(1) as u64;
                stats.net_rx_bytes_per_sec =
                    net.rx_bytes.saturating_sub(prev_net.rx_bytes) * 1000 / elapsed_ms;
                stats.net_tx_bytes_per_sec =
                    net.tx_bytes.saturating_sub(prev_net.tx_bytes) * 1000 / elapsed_ms;
            }
        }

        stats.uptime_secs = self
            .read("proc/uptime")
            .and_then(|text| parse_uptime_secs(&text))
            .unwrap_or(0);
        stats.battery_level = self
            .read_battery("capacity")
            .and_then(|value| value.parse::<u8>().ok());
        stats.battery_status = self.read_battery("status");
        stats.battery_temperature_c = self
            .read_battery("temp")
            .and_then(|value| parse_battery_temperature(&value));

        if let Some(cpu) = cpu {
            *previous = Some(Previous { cpu, net, at: now });
        }
        stats
    }

    fn realtime(&self) -> RealtimeStatus {
        let cores = self
            .read("proc/stat")
            .map(|text| count_cpu_cores(&text))
            .unwrap_or(0);
        let cpu_frequencies_mhz = (0..cores)
            .map(|core| {
                read_trimmed(&self.root.join(format!(
                    "sys/devices/system/cpu/cpu{core}/cpufreq/scaling_cur_freq"
                )))
                .and_then(|raw| parse_cpu_freq_mhz(&raw))
                .unwrap_or(0)
            })
            .collect();
        let gpu_temp_c = self.zone_temperature(&["gpu"]).or_else(|| {
            read_trimmed(&self.root.join("sys/class/kgsl/kgsl-3d0/temp"))
                .and_then(|raw| parse_thermal_celsius(&raw))
        });
        RealtimeStatus {
            cpu_frequencies_mhz,
            cpu_temp_c: self.zone_temperature(&["cpu", "tsens", "soc"]),
            gpu_temp_c,
        }
    }

    fn device_info(&self) -> DeviceInfo {
        let props = self
            .read("system/build.prop")
            .map(|text| parse_prop_file(&text))
            .unwrap_or_default();
        let prop = |key: &str| props.get(key).cloned().unwrap_or_default();
        let processor = self
            .read("proc/cpuinfo")
            .and_then(|text| parse_cpuinfo_hardware(&text))
            .or_else(|| props.get("ro.soc.model").cloned())
            .or_else(|| props.get("ro.board.platform").cloned())
            .unwrap_or_default();
        let release = prop("ro.build.version.release");
        let android_version = match props.get("ro.build.version.sdk") {
            Some(sdk) if !release.is_empty() => format!("Android {release} (API {sdk})"),
            _ if !release.is_empty() => format!("Android {release}"),
            _ => String::new(),
        };
        let uptime_secs = self
            .read("proc/uptime")
            .and_then(|text| parse_uptime_secs(&text))
            .unwrap_or(0);
        DeviceInfo {
            model: prop("ro.product.model"),
            brand: prop("ro.product.brand").to_uppercase(),
            processor,
            android_version,
            uptime_secs,
            uptime: format_duration(uptime_secs),
        }
    }
}

pub fn clamp_interval_ms(interval_ms: Option<u64>, default_ms: u64) -> u64 {
    interval_ms
        .unwrap_or(default_ms)
        .clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS)
}

fn sleep_with_stop(duration: Duration, stop_flag: &AtomicBool) {
    let mut remaining = duration;
    let chunk = Duration::from_millis(50);
    while !remaining.is_zero() {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let step = remaining.min(chunk);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

struct PollerHandle {
    stop_flag: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// At most one loop per stream. Starting a new one stops the old one first.
pub struct StatsPoller {
    stream: &'static str,
    handle: Mutex<Option<PollerHandle>>,
}

impl Default for StatsPoller {
    fn default() -> Self {
        Self::named("system")
    }
}

impl StatsPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(stream: &'static str) -> Self {
        Self {
            stream,
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|handle| handle.is_some())
            .unwrap_or(false)
    }

    /// Runs `sample` every `interval_ms` on a worker thread and hands each reading to `emit`.
    pub fn start<T, S>(
        &self,
        sample: S,
        interval_ms: u64,
        emit: Arc<dyn Fn(T) + Send + Sync>,
        trace_id: &str,
    ) -> Result<u64, AppError>
    where
        S: Fn() -> T + Send + 'static,
        T: 'static,
    {
        let interval_ms = interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        let mut guard = self
            .handle
            .lock()
            .map_err(|_| AppError::system("Stats poller locked", trace_id))?;
        if let Some(previous) = guard.take() {
            stop_handle(previous);
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_spawn = Arc::clone(&stop_flag);
        let interval = Duration::from_millis(interval_ms);
        let join = std::thread::spawn(move || loop {
            if stop_spawn.load(Ordering::Relaxed) {
                break;
            }
            let started = Instant::now();
            let reading = sample();
            if stop_spawn.load(Ordering::Relaxed) {
                break;
            }
            emit(reading);
            let elapsed = started.elapsed();
            if elapsed < interval {
                sleep_with_stop(interval - elapsed, &stop_spawn);
            }
        });
        *guard = Some(PollerHandle { stop_flag, join });
        info!(trace_id = %trace_id, stream = self.stream, interval_ms, "monitor started");
        Ok(interval_ms)
    }

    /// Returns whether a loop was running.
    pub fn stop(&self) -> bool {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                stop_handle(handle);
                debug!(stream = self.stream, "monitor stopped");
                true
            }
            None => false,
        }
    }
}

fn stop_handle(handle: PollerHandle) {
    handle.stop_flag.store(true, Ordering::Relaxed);
    if handle.join.join().is_err() {
        debug!("monitor thread panicked");
    }
}

impl Drop for StatsPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
