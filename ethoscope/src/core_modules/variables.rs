// THEORY:
// A `DataPoint` is the unit of output of the tracking core: one observation of
// one animal at one timestamp. It is an insertion-ordered list of typed
// `Variable`s so that the result writer can derive table columns from the
// first row it sees and every following row lines up with them.
//
// Each `VariableKind` carries three pieces of metadata that the core never
// interprets but must preserve: the column header, a storage type and a
// "functional type" tag used by downstream analysis to know whether a column
// is a distance, an angle, a boolean, and so on.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// Tag describing what a variable measures, used downstream for storage typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionalType {
    Distance,
    Angle,
    RelativeDistanceLog,
    Bool,
    Interaction,
    Count,
}

impl FunctionalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionalType::Distance => "distance",
            FunctionalType::Angle => "angle",
            FunctionalType::RelativeDistanceLog => "relative_distance_1e6",
            FunctionalType::Bool => "bool",
            FunctionalType::Interaction => "interaction",
            FunctionalType::Count => "count",
        }
    }
}

/// The closed set of variables a data point can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    X,
    Y,
    Width,
    Height,
    Phi,
    XyDistLog10x1000,
    IsInferred,
    BodyMovement,
    HasInteracted,
    InteractionDuration,
    FrameCount,
}

impl VariableKind {
    pub fn header_name(&self) -> &'static str {
        match self {
            VariableKind::X => "x",
            VariableKind::Y => "y",
            VariableKind::Width => "w",
            VariableKind::Height => "h",
            VariableKind::Phi => "phi",
            VariableKind::XyDistLog10x1000 => "xy_dist_log10x1000",
            VariableKind::IsInferred => "is_inferred",
            VariableKind::BodyMovement => "body_movement",
            VariableKind::HasInteracted => "has_interacted",
            VariableKind::InteractionDuration => "duration",
            VariableKind::FrameCount => "frame_count",
        }
    }

    pub fn functional_type(&self) -> FunctionalType {
        match self {
            VariableKind::X | VariableKind::Y | VariableKind::Width | VariableKind::Height => {
                FunctionalType::Distance
            }
            VariableKind::Phi => FunctionalType::Angle,
            VariableKind::XyDistLog10x1000 | VariableKind::BodyMovement => {
                FunctionalType::RelativeDistanceLog
            }
            VariableKind::IsInferred => FunctionalType::Bool,
            VariableKind::HasInteracted => FunctionalType::Interaction,
            VariableKind::InteractionDuration | VariableKind::FrameCount => FunctionalType::Count,
        }
    }

    pub fn storage_type(&self) -> &'static str {
        match self {
            VariableKind::X
            | VariableKind::Y
            | VariableKind::Width
            | VariableKind::Height
            | VariableKind::Phi
            | VariableKind::XyDistLog10x1000 => "SMALLINT",
            VariableKind::IsInferred => "BOOLEAN",
            VariableKind::HasInteracted => "SMALLINT",
            VariableKind::BodyMovement | VariableKind::InteractionDuration | VariableKind::FrameCount => "INT",
        }
    }

    /// Inclusive range of values the variable is declared to take.
    pub fn range(&self) -> (i64, i64) {
        match self {
            VariableKind::X | VariableKind::Y | VariableKind::Width | VariableKind::Height => {
                (i16::MIN as i64, i16::MAX as i64)
            }
            VariableKind::Phi => (0, 180),
            VariableKind::XyDistLog10x1000 => (i16::MIN as i64, i16::MAX as i64),
            VariableKind::IsInferred | VariableKind::HasInteracted => (0, 1),
            VariableKind::BodyMovement => (i32::MIN as i64, i32::MAX as i64),
            VariableKind::InteractionDuration | VariableKind::FrameCount => (0, i32::MAX as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VariableValue {
    Int(i64),
    Bool(bool),
}

impl VariableValue {
    pub fn as_i64(&self) -> i64 {
        match *self {
            VariableValue::Int(v) => v,
            VariableValue::Bool(b) => b as i64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.as_i64() as f64
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            VariableValue::Int(v) => v != 0,
            VariableValue::Bool(b) => b,
        }
    }
}

impl Serialize for VariableValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            VariableValue::Int(v) => serializer.serialize_i64(v),
            VariableValue::Bool(b) => serializer.serialize_bool(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Variable {
    pub kind: VariableKind,
    pub value: VariableValue,
}

impl Variable {
    pub fn int(kind: VariableKind, value: i64) -> Self {
        Self {
            kind,
            value: VariableValue::Int(value),
        }
    }

    pub fn boolean(kind: VariableKind, value: bool) -> Self {
        Self {
            kind,
            value: VariableValue::Bool(value),
        }
    }
}

/// One observation of one animal. Variables keep their insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataPoint {
    variables: Vec<Variable>,
}

impl DataPoint {
    pub fn new(variables: Vec<Variable>) -> Self {
        let mut point = Self::default();
        for v in variables {
            point.append(v);
        }
        point
    }

    /// Adds a variable, replacing any existing variable of the same kind in place.
    pub fn append(&mut self, variable: Variable) {
        if let Some(existing) = self.variables.iter_mut().find(|v| v.kind == variable.kind) {
            existing.value = variable.value;
        } else {
            self.variables.push(variable);
        }
    }

    pub fn get(&self, kind: VariableKind) -> Option<VariableValue> {
        self.variables.iter().find(|v| v.kind == kind).map(|v| v.value)
    }

    pub fn contains(&self, kind: VariableKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn is_inferred(&self) -> bool {
        self.get(VariableKind::IsInferred).map(|v| v.as_bool()).unwrap_or(false)
    }

    /// Copy of this point with x and y shifted by `(dx, dy)`; everything else untouched.
    pub fn with_offset(&self, dx: i64, dy: i64) -> Self {
        let variables = self
            .variables
            .iter()
            .map(|v| match v.kind {
                VariableKind::X => Variable::int(VariableKind::X, v.value.as_i64() + dx),
                VariableKind::Y => Variable::int(VariableKind::Y, v.value.as_i64() + dy),
                _ => *v,
            })
            .collect();
        Self { variables }
    }
}

impl Serialize for DataPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.variables.len()))?;
        for v in &self.variables {
            map.serialize_entry(v.kind.header_name(), &v.value)?;
        }
        map.end()
    }
}
