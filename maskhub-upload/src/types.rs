use std::collections::BTreeMap;
use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Software name reported when creating runs.
pub const TEST_SOFTWARE_NAME: &str = "thorlabs_laser_control";

/// Logical (x, y) die coordinate on a wafer or mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiePosition {
    pub x: i32,
    pub y: i32,
}

impl DiePosition {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for DiePosition {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

/// One laser reading, optionally with a raw time-series table.
#[derive(Debug, Clone)]
pub struct Measurement {
    /// e.g. `Laser_1_M01093719`
    pub device_id: String,
    pub position: DiePosition,
    pub current_setpoint_ma: f64,
    pub current_actual_ma: f64,
    pub voltage_v: f64,
    pub power_mw: Option<f64>,
    pub temperature_c: Option<f64>,
    /// Stamped with the current time when the measurement is added, if unset.
    pub timestamp: Option<DateTime<Local>>,
    pub metadata: BTreeMap<String, Value>,
    pub raw_data: Option<RecordBatch>,
}

impl Measurement {
    pub fn new(
        device_id: impl Into<String>,
        current_setpoint_ma: f64,
        current_actual_ma: f64,
        voltage_v: f64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            position: DiePosition::default(),
            current_setpoint_ma,
            current_actual_ma,
            voltage_v,
            power_mw: None,
            temperature_c: None,
            timestamp: None,
            metadata: BTreeMap::new(),
            raw_data: None,
        }
    }

    /// Build a timestamped measurement from a single driver/power-meter reading.
    pub fn from_test_data(
        device_id: impl Into<String>,
        current_ma: f64,
        actual_ma: f64,
        voltage_v: f64,
        power_mw: Option<f64>,
        temperature_c: Option<f64>,
    ) -> Self {
        let mut measurement = Self::new(device_id, current_ma, actual_ma, voltage_v)
            .with_timestamp(Local::now())
            .with_metadata("test_type", "laser_characterization")
            .with_metadata("current_tolerance_ma", (actual_ma - current_ma).abs());
        measurement.power_mw = power_mw;
        measurement.temperature_c = temperature_c;
        measurement
    }

    pub fn with_position(mut self, position: impl Into<DiePosition>) -> Self {
        self.position = position.into();
        self
    }

    pub fn with_power_mw(mut self, power_mw: f64) -> Self {
        self.power_mw = Some(power_mw);
        self
    }

    pub fn with_temperature_c(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_raw_data(mut self, raw_data: RecordBatch) -> Self {
        self.raw_data = Some(raw_data);
        self
    }

    /// Flatten the reading into the `test_meta` map sent with the upload.
    ///
    /// Free-form metadata can override the standard keys; `power_mw` is only
    /// present when measured.
    pub fn test_meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("device_id".into(), Value::from(self.device_id.clone()));
        meta.insert(
            "current_setpoint_ma".into(),
            Value::from(self.current_setpoint_ma),
        );
        meta.insert("current_actual_ma".into(), Value::from(self.current_actual_ma));
        meta.insert("voltage_v".into(), Value::from(self.voltage_v));
        meta.insert("temperature_c".into(), Value::from(self.temperature_c));
        meta.insert(
            "timestamp".into(),
            Value::from(self.timestamp.map(|t| t.to_rfc3339())),
        );
        for (key, value) in &self.metadata {
            meta.insert(key.clone(), value.clone());
        }
        if let Some(power) = self.power_mw {
            meta.insert("power_mw".into(), Value::from(power));
        }
        meta
    }
}

/// Identifies the run a batch of measurements belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub mask_id: i64,
    /// Must be unique on the MaskHub instance.
    pub run_name: String,
    pub lot_name: String,
    pub wafer_name: String,
    pub operator: Option<String>,
    pub station: String,
    pub measurement_type: String,
    pub project_id: Option<i64>,
    pub expected_measurements: u32,
}

impl RunConfig {
    pub fn new(mask_id: i64, run_name: impl Into<String>) -> Self {
        Self {
            mask_id,
            run_name: run_name.into(),
            lot_name: "DEFAULT_LOT".to_string(),
            wafer_name: "DEFAULT_WAFER".to_string(),
            operator: None,
            station: "Thorlabs_Laser_Station".to_string(),
            measurement_type: "laser_characterization".to_string(),
            project_id: None,
            expected_measurements: 0,
        }
    }

    pub fn with_lot(mut self, lot_name: impl Into<String>) -> Self {
        self.lot_name = lot_name.into();
        self
    }

    pub fn with_wafer(mut self, wafer_name: impl Into<String>) -> Self {
        self.wafer_name = wafer_name.into();
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_station(mut self, station: impl Into<String>) -> Self {
        self.station = station.into();
        self
    }

    pub fn with_measurement_type(mut self, measurement_type: impl Into<String>) -> Self {
        self.measurement_type = measurement_type.into();
        self
    }

    pub fn with_project_id(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_expected_measurements(mut self, count: u32) -> Self {
        self.expected_measurements = count;
        self
    }
}

/// Payload for registering a run with MaskHub.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub mask_id: i64,
    pub run_name: String,
    /// Looked up from the mask when absent.
    pub project_id: Option<i64>,
    pub config: Option<Value>,
    pub calibration: Option<Value>,
    pub uuid: Option<String>,
    pub expected_measurement_count: u32,
    pub expected_material_counts: Option<Value>,
    pub test_software_name: String,
    pub test_software_version: String,
    pub operator: Option<String>,
    pub station: Option<String>,
}

impl RunMetadata {
    pub fn from_run_config(run: &RunConfig) -> Self {
        Self {
            mask_id: run.mask_id,
            run_name: run.run_name.clone(),
            project_id: run.project_id,
            config: None,
            calibration: None,
            uuid: None,
            expected_measurement_count: run.expected_measurements,
            expected_material_counts: None,
            test_software_name: TEST_SOFTWARE_NAME.to_string(),
            test_software_version: env!("CARGO_PKG_VERSION").to_string(),
            operator: run.operator.clone(),
            station: Some(run.station.clone()),
        }
    }

    /// JSON body for `POST /runs/`. Structured fields are sent as JSON strings.
    pub fn to_payload(&self, project_id: i64) -> Value {
        let mut map = Map::new();
        map.insert("name".into(), Value::from(self.run_name.clone()));
        map.insert("project_id".into(), Value::from(project_id));
        map.insert(
            "test_software_name".into(),
            Value::from(self.test_software_name.clone()),
        );
        map.insert(
            "test_software_version".into(),
            Value::from(self.test_software_version.clone()),
        );
        map.insert(
            "expected_measurement_count".into(),
            Value::from(self.expected_measurement_count),
        );
        if let Some(config) = &self.config {
            map.insert("config".into(), Value::from(config.to_string()));
        }
        if let Some(calibration) = &self.calibration {
            map.insert("calibration".into(), Value::from(calibration.to_string()));
        }
        if let Some(uuid) = &self.uuid {
            map.insert("test_software_guid".into(), Value::from(uuid.clone()));
        }
        if let Some(counts) = &self.expected_material_counts {
            map.insert(
                "expected_material_counts".into(),
                Value::from(counts.to_string()),
            );
        }
        Value::Object(map)
    }
}

/// The file attached to an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawDataFile {
    Path(PathBuf),
    /// No raw data was captured or saved; an empty part is sent.
    Missing,
}

/// A measurement flattened for upload. Immutable once queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub mask_id: i64,
    pub run_name: String,
    pub lot_name: String,
    pub wafer_name: String,
    pub die_x: i32,
    pub die_y: i32,
    pub device_name: String,
    pub measurement_type: String,
    pub test_station_name: String,
    pub raw_data: RawDataFile,
    pub test_meta: Map<String, Value>,
    #[serde(default)]
    pub extra_meta: Map<String, Value>,
    pub timestamp: Option<String>,
    /// Client-generated key sent as `Idempotency-Key`, stable across retries.
    pub idempotency_key: Uuid,
}

impl UploadJob {
    pub fn new(
        run: &RunConfig,
        measurement: &Measurement,
        die: DiePosition,
        raw_data: RawDataFile,
    ) -> Self {
        Self {
            mask_id: run.mask_id,
            run_name: run.run_name.clone(),
            lot_name: run.lot_name.clone(),
            wafer_name: run.wafer_name.clone(),
            die_x: die.x,
            die_y: die.y,
            device_name: measurement.device_id.clone(),
            measurement_type: run.measurement_type.clone(),
            test_station_name: run.station.clone(),
            raw_data,
            test_meta: measurement.test_meta(),
            extra_meta: Map::new(),
            timestamp: measurement.timestamp.map(|t| t.to_rfc3339()),
            idempotency_key: Uuid::new_v4(),
        }
    }
}
