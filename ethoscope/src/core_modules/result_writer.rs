// THEORY:
// The result sink is where tracked rows leave the real-time loop. The loop
// must never wait on storage, so the sink contract is two cheap calls per
// frame: `write` for every ROI that produced rows, and `flush` once the frame
// is complete.
//
// Key architectural principles:
// 1.  **Buffer then Ship**: `ResultWriter::write` only serialises into an
//     in-memory buffer. `flush` hands the whole buffer to a background thread
//     through an unbounded channel and returns. The thread owns the output
//     stream and does the actual IO.
// 2.  **Self Describing Output**: before the first data row the writer emits
//     the variable map (column name, storage type, functional type) derived
//     from that row, so readers never need to know the tracker in advance.
// 3.  **Activity Summary**: alongside raw rows the writer can keep a
//     DAM-style activity count: per period and per ROI, the summed
//     displacement of the animal relative to the ROI size. Periods are only
//     emitted once complete, when a flush arrives from a later period.

use crate::core_modules::roi::Roi;
use crate::core_modules::variables::{DataPoint, VariableKind};
use crate::error::SinkError;
use image::GrayImage;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufWriter, Write};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Destination of the rows produced by the monitor.
pub trait ResultSink: Send {
    /// Rows of one ROI at time `t` (ms). Called only for ROIs with rows.
    fn write(&mut self, t: i64, roi: &Roi, rows: &[DataPoint]) -> Result<(), SinkError>;

    /// Called once per frame, after every ROI has been written.
    fn flush(&mut self, t: i64, frame: &GrayImage, frame_idx: u64) -> Result<(), SinkError>;

    /// Called once when the experiment ends.
    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps everything in memory. Handy for tests and short replays.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: Vec<(i64, u32, Vec<DataPoint>)>,
    /// `(t, frame_idx)` of every flush.
    pub flushes: Vec<(i64, u64)>,
    pub closed: bool,
}

impl ResultSink for MemorySink {
    fn write(&mut self, t: i64, roi: &Roi, rows: &[DataPoint]) -> Result<(), SinkError> {
        self.rows.push((t, roi.idx(), rows.to_vec()));
        Ok(())
    }

    fn flush(&mut self, t: i64, _frame: &GrayImage, frame_idx: u64) -> Result<(), SinkError> {
        self.flushes.push((t, frame_idx));
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.closed = true;
        Ok(())
    }
}

/// Metadata of one output column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableInfo {
    pub name: &'static str,
    pub storage_type: &'static str,
    pub functional_type: &'static str,
}

impl From<VariableKind> for VariableInfo {
    fn from(kind: VariableKind) -> Self {
        Self {
            name: kind.header_name(),
            storage_type: kind.storage_type(),
            functional_type: kind.functional_type().as_str(),
        }
    }
}

/// Activity of every known ROI over one completed period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DamRecord {
    /// Start of the period in ms.
    pub start_ms: i64,
    /// ROI idx to summed relative displacement, scaled by 100 and rounded.
    pub activity: BTreeMap<u32, i64>,
}

/// Per-period, per-ROI summed displacement normalised by the ROI longest axis.
#[derive(Debug, Clone)]
pub struct DamActivity {
    period_ms: i64,
    scale: f64,
    accumulated: BTreeMap<i64, BTreeMap<u32, f64>>,
    last_positions: HashMap<u32, (f64, f64)>,
}

impl DamActivity {
    pub fn new(period_ms: i64) -> Self {
        Self {
            period_ms: period_ms.max(1),
            scale: 100.0,
            accumulated: BTreeMap::new(),
            last_positions: HashMap::new(),
        }
    }

    fn tick(&self, t: i64) -> i64 {
        (t as f64 / self.period_ms as f64).round() as i64
    }

    /// Adds the displacement of `point` since the previous point of the same ROI.
    pub fn input(&mut self, t: i64, roi: &Roi, point: &DataPoint) {
        let (Some(x), Some(y)) = (point.get(VariableKind::X), point.get(VariableKind::Y)) else {
            return;
        };
        let current = (x.as_f64(), y.as_f64());
        let distance = match self.last_positions.insert(roi.idx(), current) {
            Some(last) => {
                let (dx, dy) = (current.0 - last.0, current.1 - last.1);
                (dx * dx + dy * dy).sqrt() / roi.longest_axis().max(1) as f64
            }
            None => 0.0,
        };
        let tick = self.tick(t);
        *self
            .accumulated
            .entry(tick)
            .or_default()
            .entry(roi.idx())
            .or_insert(0.0) += distance;
    }

    /// Drains every period before the one containing `t`. Gaps are filled with zeros.
    pub fn flush(&mut self, t: i64) -> Vec<DamRecord> {
        let tick = self.tick(t);
        let Some(&first) = self.accumulated.keys().next() else {
            return Vec::new();
        };
        if tick - first > 1 {
            warn!("DAM activity: no data for more than one period before {} ms", t);
        }

        let mut rois: Vec<u32> = self.last_positions.keys().copied().collect();
        rois.sort_unstable();

        let mut records = Vec::new();
        for i in first..tick {
            let sums = self.accumulated.remove(&i).unwrap_or_default();
            let activity = rois
                .iter()
                .map(|&idx| {
                    let sum = sums.get(&idx).copied().unwrap_or(0.0);
                    (idx, (self.scale * sum).round() as i64)
                })
                .collect();
            records.push(DamRecord {
                start_ms: i * self.period_ms,
                activity,
            });
        }
        records
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Variables { variables: Vec<VariableInfo> },
    Row { t: i64, roi: u32, data: &'a DataPoint },
    Dam(&'a DamRecord),
}

enum Message {
    Lines(Vec<String>),
    Stop,
}

/// Writes results as JSON lines from a background thread.
pub struct ResultWriter {
    sender: mpsc::UnboundedSender<Message>,
    buffer: Vec<String>,
    variables_written: bool,
    dam: Option<DamActivity>,
    worker: Option<JoinHandle<()>>,
}

impl ResultWriter {
    /// Spawns the writer thread over `out`. `dam_period_ms` enables the activity summary.
    pub fn new<W: Write + Send + 'static>(out: W, dam_period_ms: Option<i64>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();

        let worker = std::thread::spawn(move || {
            let mut out = BufWriter::new(out);
            let mut lines_written = 0u64;
            while let Some(message) = receiver.blocking_recv() {
                match message {
                    Message::Lines(lines) => {
                        for line in &lines {
                            if let Err(e) = writeln!(out, "{}", line) {
                                error!("result writer: {}", e);
                            }
                        }
                        lines_written += lines.len() as u64;
                        if let Err(e) = out.flush() {
                            error!("result writer: {}", e);
                        }
                    }
                    Message::Stop => break,
                }
            }
            if let Err(e) = out.flush() {
                error!("result writer: {}", e);
            }
            info!("result writer stopped after {} lines", lines_written);
        });

        Self {
            sender,
            buffer: Vec::new(),
            variables_written: false,
            dam: dam_period_ms.map(DamActivity::new),
            worker: Some(worker),
        }
    }

    fn push(&mut self, record: &Record<'_>) -> Result<(), SinkError> {
        self.buffer.push(serde_json::to_string(record)?);
        Ok(())
    }

    fn ship(&mut self) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let lines = std::mem::take(&mut self.buffer);
        self.sender.send(Message::Lines(lines)).map_err(|_| SinkError::Closed)
    }
}

impl ResultSink for ResultWriter {
    fn write(&mut self, t: i64, roi: &Roi, rows: &[DataPoint]) -> Result<(), SinkError> {
        if self.worker.is_none() {
            return Err(SinkError::Closed);
        }
        if !self.variables_written {
            if let Some(first) = rows.first() {
                let variables = first.iter().map(|v| VariableInfo::from(v.kind)).collect();
                self.push(&Record::Variables { variables })?;
                self.variables_written = true;
            }
        }
        for row in rows {
            self.push(&Record::Row {
                t,
                roi: roi.idx(),
                data: row,
            })?;
            if let Some(dam) = self.dam.as_mut() {
                dam.input(t, roi, row);
            }
        }
        Ok(())
    }

    fn flush(&mut self, t: i64, _frame: &GrayImage, _frame_idx: u64) -> Result<(), SinkError> {
        let records = self.dam.as_mut().map(|dam| dam.flush(t)).unwrap_or_default();
        for record in &records {
            self.push(&Record::Dam(record))?;
        }
        self.ship()
    }

    /// Ships what is left and waits for the writer thread to finish.
    fn close(&mut self) -> Result<(), SinkError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let shipped = self.ship();
        let _ = self.sender.send(Message::Stop);
        if worker.join().is_err() {
            error!("result writer thread panicked");
        }
        shipped
    }
}

impl Drop for ResultWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("result writer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::hardware::tests::SharedPort;
    use crate::core_modules::variables::Variable;

    fn row(x: i64, y: i64) -> DataPoint {
        DataPoint::new(vec![
            Variable::int(VariableKind::X, x),
            Variable::int(VariableKind::Y, y),
            Variable::boolean(VariableKind::IsInferred, false),
        ])
    }

    fn roi(idx: u32) -> Roi {
        Roi::from_rectangle(0, 0, 100, 20, idx).unwrap()
    }

    #[test]
    fn memory_sink_records_writes_and_flushes() {
        let mut sink = MemorySink::default();
        let frame = GrayImage::new(1, 1);
        sink.write(40, &roi(2), &[row(1, 2)]).unwrap();
        sink.flush(40, &frame, 1).unwrap();
        sink.close().unwrap();
        assert_eq!(sink.rows.len(), 1);
        assert_eq!(sink.rows[0].1, 2);
        assert_eq!(sink.flushes, vec![(40, 1)]);
        assert!(sink.closed);
    }

    #[test]
    fn variable_map_precedes_the_first_row_only() {
        let port = SharedPort::default();
        let mut writer = ResultWriter::new(port.clone(), None);
        let frame = GrayImage::new(1, 1);

        writer.write(0, &roi(1), &[row(10, 5)]).unwrap();
        writer.write(0, &roi(2), &[row(20, 5)]).unwrap();
        writer.flush(0, &frame, 0).unwrap();
        writer.write(40, &roi(1), &[row(11, 5)]).unwrap();
        writer.flush(40, &frame, 1).unwrap();
        writer.close().unwrap();

        let lines: Vec<serde_json::Value> = port
            .text()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["type"], "variables");
        assert_eq!(lines[0]["variables"][0]["name"], "x");
        assert_eq!(lines[0]["variables"][0]["storage_type"], "SMALLINT");
        assert_eq!(lines[0]["variables"][2]["functional_type"], "bool");
        assert!(lines[1..].iter().all(|l| l["type"] == "row"));
        assert_eq!(lines[3]["t"], 40);
        assert_eq!(lines[3]["roi"], 1);
        assert_eq!(lines[3]["data"]["x"], 11);
    }

    #[test]
    fn writing_after_close_fails() {
        let mut writer = ResultWriter::new(SharedPort::default(), None);
        writer.close().unwrap();
        assert!(matches!(
            writer.write(0, &roi(1), &[row(0, 0)]),
            Err(SinkError::Closed)
        ));
    }

    #[test]
    fn dam_activity_emits_completed_periods() {
        let mut dam = DamActivity::new(1000);
        let r1 = roi(1);
        let r2 = roi(2);
        dam.input(0, &r1, &row(0, 0));
        dam.input(0, &r2, &row(0, 0));
        // 30 px on a 100 px long ROI
        dam.input(200, &r1, &row(30, 0));
        dam.input(400, &r1, &row(30, 40));
        assert!(dam.flush(400).is_empty());

        let records = dam.flush(1600);
        // ticks 0 and 1 are complete once t rounds to tick 2
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].start_ms, 0);
        assert_eq!(records[0].activity.get(&1), Some(&70));
        assert_eq!(records[0].activity.get(&2), Some(&0));
        assert_eq!(records[1].activity.get(&1), Some(&0));
    }

    #[test]
    fn dam_records_are_written_on_flush() {
        let port = SharedPort::default();
        let mut writer = ResultWriter::new(port.clone(), Some(1000));
        let frame = GrayImage::new(1, 1);
        writer.write(0, &roi(1), &[row(0, 0)]).unwrap();
        writer.flush(0, &frame, 0).unwrap();
        writer.write(1000, &roi(1), &[row(50, 0)]).unwrap();
        writer.flush(1000, &frame, 1).unwrap();
        writer.close().unwrap();

        let text = port.text();
        let dam: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
            .filter(|l| l["type"] == "dam")
            .collect();
        assert_eq!(dam.len(), 1);
        assert_eq!(dam[0]["start_ms"], 0);
        assert_eq!(dam[0]["activity"]["1"], 0);
    }
}
