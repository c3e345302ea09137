//! DLS particle size analyzer over RS-232.
//!
//! Protocol Overview:
//! - Requests are raw bytes, replies are single text lines
//! - `0x31` COM check, answered with `K`
//! - `0x33` set zero (no sample present)
//! - `0x34` run one sample measurement
//! - `0x36 <id>` select measurement setup `id`
//! - `0x37 <n>` request result block `n` (1 loading, 2-4 mean diameters, 5 percentiles)
//!
//! Status letters: `K` ok, `N` request failed, `E` host PC error. Anything
//! else is a protocol mismatch.

use crate::error::{AppResult, RigError};
use crate::hardware::adapter::{DeviceAdapter, DeviceCommand, DeviceResponse};
use crate::hardware::transport::{DeviceLink, Endpoint, LineTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const COM_CHECK: u8 = 0x31;
const SET_ZERO: u8 = 0x33;
const RUN: u8 = 0x34;
const SELECT_SETUP: u8 = 0x36;
const REQUEST_DATA: u8 = 0x37;

/// One measurement run as reported by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlsRun {
    /// Run number, from 1
    pub run: u32,
    /// Time the run finished
    pub finished_at: DateTime<Utc>,
    /// Sample loading index
    pub loading_index: f64,
    /// Mean volume diameter
    pub mean_volume_diameter: f64,
    /// Mean area diameter
    pub mean_area_diameter: f64,
    /// Mean number diameter
    pub mean_number_diameter: f64,
    /// d(10%) .. d(90%), d(95%)
    pub percentiles: Vec<f64>,
}

impl DlsRun {
    /// Dilution assessment from the loading index.
    pub fn signal_quality(&self) -> &'static str {
        if self.loading_index < 0.1 {
            "Over-Dilution"
        } else if self.loading_index > 100.0 {
            "Under-Dilution"
        } else {
            "Good"
        }
    }
}

/// All runs of one `request_data` call, written to the save path as CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlsReport {
    /// Measurement runs in order
    pub runs: Vec<DlsRun>,
    /// Per-column mean over all runs
    pub average: Option<DlsRun>,
}

impl DlsReport {
    fn from_runs(runs: Vec<DlsRun>) -> Self {
        let average = runs.last().map(|last| {
            let n = runs.len() as f64;
            let mean = |f: fn(&DlsRun) -> f64| runs.iter().map(f).sum::<f64>() / n;
            let width = runs.iter().map(|r| r.percentiles.len()).min().unwrap_or(0);
            DlsRun {
                run: 0,
                finished_at: last.finished_at,
                loading_index: mean(|r| r.loading_index),
                mean_volume_diameter: mean(|r| r.mean_volume_diameter),
                mean_area_diameter: mean(|r| r.mean_area_diameter),
                mean_number_diameter: mean(|r| r.mean_number_diameter),
                percentiles: (0..width)
                    .map(|i| runs.iter().map(|r| r.percentiles[i]).sum::<f64>() / n)
                    .collect(),
            }
        });
        Self { runs, average }
    }

    /// Write one CSV row per run followed by an `average` row.
    fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let width = self
            .runs
            .iter()
            .map(|r| r.percentiles.len())
            .max()
            .unwrap_or(0);
        let mut writer = csv::Writer::from_path(path)?;

        let mut header: Vec<String> = [
            "run",
            "finished_at",
            "loading_index",
            "signal_quality",
            "mean_volume_diameter",
            "mean_area_diameter",
            "mean_number_diameter",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        header.extend((0..width).map(percentile_label));
        writer.write_record(&header)?;

        for run in &self.runs {
            writer.write_record(csv_row(run.run.to_string(), run, width))?;
        }
        if let Some(average) = &self.average {
            writer.write_record(csv_row("average".to_string(), average, width))?;
        }
        writer.flush()?;
        Ok(())
    }
}

const PERCENTILE_LABELS: [&str; 10] = [
    "d10", "d20", "d30", "d40", "d50", "d60", "d70", "d80", "d90", "d95",
];

fn percentile_label(index: usize) -> String {
    PERCENTILE_LABELS
        .get(index)
        .map_or_else(|| format!("p{}", index + 1), ToString::to_string)
}

/// Row cells for `run`, padded with empty cells up to `width` percentiles.
fn csv_row(label: String, run: &DlsRun, width: usize) -> Vec<String> {
    let mut row = vec![
        label,
        run.finished_at.to_rfc3339(),
        run.loading_index.to_string(),
        run.signal_quality().to_string(),
        run.mean_volume_diameter.to_string(),
        run.mean_area_diameter.to_string(),
        run.mean_number_diameter.to_string(),
    ];
    row.extend((0..width).map(|i| {
        run.percentiles
            .get(i)
            .map(ToString::to_string)
            .unwrap_or_default()
    }));
    row
}

/// Live DLS analyzer adapter.
pub struct DlsAdapter {
    link: DeviceLink,
    command_timeout: Duration,
    set_zero_timeout: Duration,
    run_timeout: Duration,
}

impl DlsAdapter {
    /// Adapter for the analyzer at `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::from_link(DeviceLink::new("DLS", endpoint))
    }

    /// Adapter over an already connected transport.
    pub fn with_transport(transport: Box<dyn LineTransport>) -> Self {
        Self::from_link(DeviceLink::connected("DLS", transport))
    }

    fn from_link(link: DeviceLink) -> Self {
        Self {
            link,
            command_timeout: Duration::from_secs(5),
            set_zero_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(500),
        }
    }

    /// Set the reply timeout for short commands.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the reply timeout for a measurement run.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    async fn send(&self, request: &[u8], timeout: Duration) -> AppResult<String> {
        let reply = self.link.request(request, timeout).await?;
        debug!(request = ?request, %reply, "DLS replied");
        Ok(reply)
    }

    /// Map a status reply onto the error taxonomy.
    fn check_status(reply: &str, failure: &str) -> AppResult<()> {
        match reply {
            "K" => Ok(()),
            "N" => Err(RigError::request_failed("DLS", failure)),
            "E" => Err(RigError::ErrorOccurred {
                device: "DLS".to_string(),
                message: "Error has occurred on the HOST PC".to_string(),
            }),
            other => Err(RigError::unexpected("DLS", other)),
        }
    }

    /// Verify the RS-232 link is alive.
    pub async fn com_check(&self) -> AppResult<()> {
        let reply = self.send(&[COM_CHECK], self.command_timeout).await?;
        if reply == "K" {
            Ok(())
        } else {
            Err(RigError::unexpected("DLS", reply))
        }
    }

    /// Select the measurement setup applied to subsequent runs.
    pub async fn select_measurement_setup(&self, setup_id: u8) -> AppResult<()> {
        let reply = self
            .send(&[SELECT_SETUP, setup_id], self.command_timeout)
            .await?;
        Self::check_status(&reply, "Measurement Setup Selection Failed")
    }

    /// Zero the instrument with no sample present.
    pub async fn set_zero(&self) -> AppResult<()> {
        let reply = self.send(&[SET_ZERO], self.set_zero_timeout).await?;
        Self::check_status(&reply, "Set Zero Failed: High Background")
    }

    /// Start one measurement and wait for its status.
    pub async fn run(&self) -> AppResult<()> {
        let reply = self.send(&[RUN], self.run_timeout).await?;
        Self::check_status(&reply, "Sample Measurement Failed")
    }

    /// Request result block `block` and parse its values.
    async fn data_block(&self, block: u8) -> AppResult<Vec<f64>> {
        let reply = self
            .send(&[REQUEST_DATA, block], self.command_timeout)
            .await?;
        parse_data_reply(&reply)
    }

    /// Run `runs` measurements, collect their results, and save them to `save_path`.
    pub async fn request_data(&self, runs: u32, save_path: &Path) -> AppResult<DlsReport> {
        let mut collected = Vec::with_capacity(runs as usize);
        for run in 1..=runs {
            self.run().await?;

            let loading = self.data_block(1).await?;
            let volume = self.data_block(2).await?;
            let area = self.data_block(3).await?;
            let number = self.data_block(4).await?;
            let percentiles = self.data_block(5).await?;

            let first = |values: &[f64]| -> AppResult<f64> {
                values
                    .first()
                    .copied()
                    .ok_or_else(|| RigError::unexpected("DLS", "empty data block"))
            };

            collected.push(DlsRun {
                run,
                finished_at: Utc::now(),
                loading_index: first(&loading)?,
                mean_volume_diameter: first(&volume)?,
                mean_area_diameter: first(&area)?,
                mean_number_diameter: first(&number)?,
                percentiles,
            });
            info!(run, of = runs, "DLS run finished");
        }

        let report = DlsReport::from_runs(collected);
        report.save(save_path)?;
        info!(path = %save_path.display(), "DLS data saved");
        Ok(report)
    }
}

/// Parse a `0x37` reply: `K <value>` or `K <p> <value> <p> <value> ...`.
fn parse_data_reply(reply: &str) -> AppResult<Vec<f64>> {
    let tokens: Vec<&str> = reply.split_whitespace().collect();
    match tokens.first().copied() {
        Some("K") => {
            let values: Vec<&str> = if tokens.len() == 2 {
                tokens[1..].to_vec()
            } else {
                tokens.iter().skip(2).step_by(2).copied().collect()
            };
            values
                .into_iter()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|_| RigError::unexpected("DLS", reply))
                })
                .collect()
        }
        Some("N") => Err(RigError::request_failed("DLS", "Invalid Data Request")),
        _ => Err(RigError::unexpected("DLS", reply)),
    }
}

#[async_trait]
impl DeviceAdapter for DlsAdapter {
    fn name(&self) -> &str {
        "DLS"
    }

    async fn initialize(&self) -> AppResult<bool> {
        self.link.open(self.command_timeout).await?;
        self.com_check().await?;
        info!("DLS COM check successful");
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        match command.action.as_str() {
            "select_measurement_setup" => {
                let id = command.u64_param("id")?;
                let id = u8::try_from(id).map_err(|_| {
                    RigError::InvalidParameter(format!("setup id {id} does not fit in one byte"))
                })?;
                self.select_measurement_setup(id).await?;
                Ok(DeviceResponse::Ack)
            }
            "set_zero" => {
                self.set_zero().await?;
                Ok(DeviceResponse::Ack)
            }
            "request_data" => {
                let runs = command.u64_param("num_of_runs")?;
                let runs = u32::try_from(runs).map_err(|_| {
                    RigError::InvalidParameter(format!("{runs} runs is out of range"))
                })?;
                let path = PathBuf::from(command.str_param("save_path")?);
                self.request_data(runs, &path).await?;
                Ok(DeviceResponse::Flag(true))
            }
            other => Err(RigError::UnsupportedCommand {
                device: "DLS".to_string(),
                action: other.to_string(),
            }),
        }
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.link.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::StreamTransport;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Fake analyzer answering each request byte sequence from a fixed script.
    fn spawn_analyzer(
        stream: DuplexStream,
        script: Vec<(Vec<u8>, &'static str)>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(stream);
            for (expected, reply) in script {
                let mut buf = vec![0u8; expected.len()];
                if read.read_exact(&mut buf).await.is_err() {
                    return;
                }
                assert_eq!(buf, expected);
                write
                    .write_all(format!("{reply}\r\n").as_bytes())
                    .await
                    .unwrap();
            }
        })
    }

    fn adapter(stream: DuplexStream) -> DlsAdapter {
        DlsAdapter::with_transport(Box::new(StreamTransport::new(stream)))
            .with_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_parse_data_reply() {
        assert_eq!(parse_data_reply("K 12.5").unwrap(), vec![12.5]);
        assert_eq!(
            parse_data_reply("K 10 1.5 20 2.5 30 3.5").unwrap(),
            vec![1.5, 2.5, 3.5]
        );
        assert!(matches!(
            parse_data_reply("N"),
            Err(RigError::RequestFailed { .. })
        ));
        assert!(matches!(
            parse_data_reply("?"),
            Err(RigError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_initialize_runs_com_check() {
        let (client, device) = duplex(64);
        let analyzer = spawn_analyzer(device, vec![(vec![0x31], "K")]);
        let dls = adapter(client);

        assert!(dls.initialize().await.unwrap());
        analyzer.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_selection_status_mapping() {
        let (client, device) = duplex(64);
        let analyzer = spawn_analyzer(
            device,
            vec![(vec![0x36, 5], "K"), (vec![0x36, 6], "N"), (vec![0x36, 7], "X")],
        );
        let dls = adapter(client);
        let select = |id: u64| DeviceCommand::new("select_measurement_setup").with("id", id);

        assert_eq!(dls.execute(&select(5)).await.unwrap(), DeviceResponse::Ack);
        assert!(matches!(
            dls.execute(&select(6)).await,
            Err(RigError::RequestFailed { .. })
        ));
        assert!(matches!(
            dls.execute(&select(7)).await,
            Err(RigError::UnexpectedResponse { .. })
        ));
        analyzer.await.unwrap();
    }

    #[tokio::test]
    async fn test_host_error_requires_operator() {
        let (client, device) = duplex(64);
        let _analyzer = spawn_analyzer(device, vec![(vec![0x34], "E")]);
        let dls = adapter(client);

        let err = dls.run().await.unwrap_err();
        assert!(matches!(err, RigError::ErrorOccurred { .. }));
        assert!(err.requires_operator());
    }

    #[tokio::test]
    async fn test_request_data_saves_report() {
        let (client, device) = duplex(256);
        let mut script = Vec::new();
        for loading in ["K 1.0", "K 3.0"] {
            script.push((vec![0x34], "K"));
            script.push((vec![0x37, 1], loading));
            script.push((vec![0x37, 2], "K 200"));
            script.push((vec![0x37, 3], "K 150"));
            script.push((vec![0x37, 4], "K 90"));
            script.push((vec![0x37, 5], "K 10 50 50 120 90 300"));
        }
        let analyzer = spawn_analyzer(device, script);
        let dls = adapter(client);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dls").join("sample_1.csv");
        let cmd = DeviceCommand::new("request_data")
            .with("num_of_runs", 2)
            .with("save_path", path.to_string_lossy().to_string());

        assert_eq!(dls.execute(&cmd).await.unwrap(), DeviceResponse::Flag(true));
        analyzer.await.unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header = reader.headers().unwrap().clone();
        assert_eq!(&header[0], "run");
        assert_eq!(&header[3], "signal_quality");
        assert_eq!(header.iter().skip(7).collect::<Vec<_>>(), vec!["d10", "d20", "d30"]);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], "1");
        assert_eq!(&rows[0][2], "1");
        assert_eq!(rows[1].iter().skip(7).collect::<Vec<_>>(), vec!["50", "120", "300"]);
        assert_eq!(&rows[2][0], "average");
        assert_eq!(&rows[2][2], "2");
        assert_eq!(&rows[2][3], "Good");
    }

    #[test]
    fn test_uneven_percentiles_are_padded() {
        let run = |n: u32, percentiles: Vec<f64>| DlsRun {
            run: n,
            finished_at: Utc::now(),
            loading_index: 0.05,
            mean_volume_diameter: 1.0,
            mean_area_diameter: 1.0,
            mean_number_diameter: 1.0,
            percentiles,
        };
        let report = DlsReport::from_runs(vec![run(1, vec![1.0, 2.0]), run(2, vec![3.0])]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample_2.csv");
        report.save(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(&rows[0][3], "Over-Dilution");
        assert_eq!(&rows[1][8], "");
        assert_eq!(rows[2].iter().skip(7).collect::<Vec<_>>(), vec!["2", ""]);
    }

    #[tokio::test]
    async fn test_run_uses_its_own_timeout() {
        let (client, device) = duplex(64);
        let dls = adapter(client).with_run_timeout(Duration::from_millis(30));

        let err = dls.run().await.unwrap_err();
        assert!(matches!(
            err,
            RigError::Timeout { timeout, .. } if timeout == Duration::from_millis(30)
        ));
        drop(device);
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let (client, _device) = duplex(64);
        let dls = adapter(client);
        let err = dls.execute(&DeviceCommand::new("calibrate")).await.unwrap_err();
        assert!(matches!(err, RigError::UnsupportedCommand { .. }));
    }
}
