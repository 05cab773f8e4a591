//! The chunked array group every run appends to.
//!
//! Arrays are Zarr V3 arrays written through zarrs. The root `zarr.json`
//! carries the group attributes and, inline, the metadata of every array.
//! That document is the commit point: readers open arrays from the entries
//! it holds, and new shapes or chunk layouts become visible only when it is
//! rewritten. Each array's own `zarr.json` mirrors its committed entry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use zarrs::array::codec::GzipCodec;
use zarrs::array::{Array, ArrayBuilder, ArrayMetadata, ChunkGrid, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs::storage::{
    ListableStorageTraits, ReadableStorageTraits, ReadableWritableListableStorage,
    ReadableWritableListableStorageTraits, WritableStorageTraits,
};

use crate::dataset::{
    ArrayData, Attrs, Dataset, TIME_UNITS, TimeEncoding, Variable, seconds_to_datetime,
};
use crate::error::EtlError;
use crate::storage::{
    Protocol, StorageOptions, join_key, location, open_storage, storage_error, store_key,
    store_prefix,
};

pub const ZARR_JSON: &str = "zarr.json";
pub const DEFAULT_TIME_CHUNK: u64 = 24;

const CONSOLIDATED_KEY: &str = "consolidated_metadata";
const GZIP_LEVEL: u32 = 1;

type StoredArray = Array<dyn ReadableWritableListableStorageTraits>;

fn zarr_error(err: impl fmt::Display) -> EtlError {
    EtlError::Zarr(err.to_string())
}

fn metadata_error(context: &str, err: impl fmt::Display) -> EtlError {
    EtlError::Metadata(format!("{context}: {err}"))
}

fn attrs_map(attrs: &Attrs) -> Map<String, Value> {
    attrs.iter().map(|(key, value)| (key.clone(), value.clone())).collect()
}

#[derive(Debug, Deserialize)]
struct ChunkGridEntry {
    configuration: RegularGridEntry,
}

#[derive(Debug, Deserialize)]
struct RegularGridEntry {
    chunk_shape: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct ArrayEntry {
    shape: Vec<u64>,
    data_type: String,
    chunk_grid: ChunkGridEntry,
    #[serde(default)]
    attributes: Attrs,
    #[serde(default)]
    dimension_names: Option<Vec<Option<String>>>,
}

/// What the committed metadata says about one array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLayout {
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub data_type: String,
    pub dims: Vec<String>,
    pub attrs: Attrs,
}

impl ArrayLayout {
    fn from_entry(name: &str, entry: &Value) -> Result<Self, EtlError> {
        let entry: ArrayEntry =
            serde_json::from_value(entry.clone()).map_err(|err| metadata_error(name, err))?;
        if entry.shape.len() != entry.chunk_grid.configuration.chunk_shape.len() {
            return Err(EtlError::Metadata(format!(
                "{name}: shape and chunks differ in rank"
            )));
        }
        let dims = entry
            .dimension_names
            .unwrap_or_default()
            .into_iter()
            .map(|dim| dim.ok_or_else(|| EtlError::Metadata(format!("{name} has an unnamed dimension"))))
            .collect::<Result<Vec<_>, _>>()?;
        if dims.len() != entry.shape.len() {
            return Err(EtlError::Metadata(format!("{name} has no dimension names")));
        }
        Ok(Self {
            shape: entry.shape,
            chunks: entry.chunk_grid.configuration.chunk_shape,
            data_type: entry.data_type,
            dims,
            attrs: entry.attributes,
        })
    }

    pub fn len(&self) -> u64 {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.shape.contains(&0)
    }
}

/// The committed root document: group metadata plus every array's metadata,
/// keyed by array name.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedMetadata {
    group: Map<String, Value>,
    pub metadata: BTreeMap<String, Value>,
}

impl ConsolidatedMetadata {
    fn new(group: Value, metadata: BTreeMap<String, Value>) -> Result<Self, EtlError> {
        let Value::Object(mut group) = group else {
            return Err(EtlError::Metadata("group metadata is not an object".to_string()));
        };
        group.remove(CONSOLIDATED_KEY);
        Ok(Self { group, metadata })
    }

    fn parse(bytes: &[u8]) -> Result<Self, EtlError> {
        let mut document: Value =
            serde_json::from_slice(bytes).map_err(|err| metadata_error(ZARR_JSON, err))?;
        let entries = document
            .get_mut(CONSOLIDATED_KEY)
            .and_then(|consolidated| consolidated.get_mut("metadata"))
            .map(Value::take)
            .ok_or_else(|| EtlError::Metadata(format!("{ZARR_JSON} has no consolidated metadata")))?;
        let metadata = serde_json::from_value(entries).map_err(|err| metadata_error(ZARR_JSON, err))?;
        Self::new(document, metadata)
    }

    fn to_document(&self) -> Value {
        let mut document = self.group.clone();
        document.insert(
            CONSOLIDATED_KEY.to_string(),
            json!({
                "kind": "inline",
                "must_understand": false,
                "metadata": self.metadata,
            }),
        );
        Value::Object(document)
    }

    pub fn array_names(&self) -> Vec<String> {
        self.metadata.keys().cloned().collect()
    }

    pub fn has_array(&self, name: &str) -> bool {
        self.metadata.contains_key(name)
    }

    /// Raw committed metadata of `name`.
    pub fn entry(&self, name: &str) -> Result<&Value, EtlError> {
        self.metadata
            .get(name)
            .ok_or_else(|| EtlError::Metadata(format!("no array named {name}")))
    }

    pub fn array(&self, name: &str) -> Result<ArrayLayout, EtlError> {
        ArrayLayout::from_entry(name, self.entry(name)?)
    }

    pub fn dims(&self, name: &str) -> Result<Vec<String>, EtlError> {
        Ok(self.array(name)?.dims)
    }

    pub fn array_attrs(&self, name: &str) -> Result<Attrs, EtlError> {
        Ok(self.array(name)?.attrs)
    }

    pub fn group_attrs(&self) -> Attrs {
        match self.group.get("attributes") {
            Some(Value::Object(attrs)) => attrs.clone().into_iter().collect(),
            _ => Attrs::new(),
        }
    }
}

/// How a dataset is split into chunks on first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunking {
    pub time_chunk: u64,
}

impl Default for Chunking {
    fn default() -> Self {
        Self {
            time_chunk: DEFAULT_TIME_CHUNK,
        }
    }
}

impl Chunking {
    /// Data variables are split every `time_chunk` steps along time and kept
    /// whole along every other dimension. Coordinates are a single chunk.
    pub fn chunks_for(&self, var: &Variable) -> Vec<u64> {
        var.dims
            .iter()
            .zip(var.data.shape())
            .map(|(dim, len)| {
                let len = *len as u64;
                if dim == "time" && !var.is_coordinate() {
                    self.time_chunk.min(len).max(1)
                } else {
                    len.max(1)
                }
            })
            .collect()
    }
}

fn zarr_type(data: &ArrayData) -> (DataType, FillValue) {
    match data {
        ArrayData::F32(_) => (DataType::Float32, FillValue::from(f32::NAN)),
        ArrayData::F64(_) => (DataType::Float64, FillValue::from(f64::NAN)),
        ArrayData::I64(_) => (DataType::Int64, FillValue::from(0i64)),
    }
}

fn store_values(array: &StoredArray, start: &[u64], data: &ArrayData) -> Result<(), EtlError> {
    if data.shape().contains(&0) {
        return Ok(());
    }
    match data {
        ArrayData::F32(values) => array.store_array_subset_ndarray(start, values.clone()),
        ArrayData::F64(values) => array.store_array_subset_ndarray(start, values.clone()),
        ArrayData::I64(values) => array.store_array_subset_ndarray(start, values.clone()),
    }
    .map_err(zarr_error)
}

fn retrieve_values(array: &StoredArray, name: &str, layout: &ArrayLayout) -> Result<ArrayData, EtlError> {
    let subset = ArraySubset::new_with_shape(layout.shape.clone());
    let data = match layout.data_type.as_str() {
        "float32" => ArrayData::F32(array.retrieve_array_subset_ndarray::<f32>(&subset).map_err(zarr_error)?),
        "float64" => ArrayData::F64(array.retrieve_array_subset_ndarray::<f64>(&subset).map_err(zarr_error)?),
        "int64" => ArrayData::I64(array.retrieve_array_subset_ndarray::<i64>(&subset).map_err(zarr_error)?),
        other => {
            return Err(EtlError::Metadata(format!("{name}: unsupported data type {other}")));
        }
    };
    Ok(data)
}

/// The chunk key encoding a rewrite switches to, so the rewritten chunks
/// never land on keys the committed layout still reads.
fn alternate_key_encoding(entry: &Value) -> Value {
    match entry.pointer("/chunk_key_encoding/name").and_then(Value::as_str) {
        Some("v2") => json!({ "name": "default", "configuration": { "separator": "/" } }),
        _ => json!({ "name": "v2", "configuration": { "separator": "." } }),
    }
}

/// A group of chunked arrays on zarrs storage, with consolidated metadata.
pub struct ZarrStore {
    storage: ReadableWritableListableStorage,
    location: String,
}

impl ZarrStore {
    pub fn new(storage: ReadableWritableListableStorage, location: impl Into<String>) -> Self {
        Self {
            storage,
            location: location.into(),
        }
    }

    pub fn open(protocol: Protocol, path: &str, options: &StorageOptions) -> Result<Self, EtlError> {
        Ok(Self::new(open_storage(protocol, path, options)?, location(protocol, path)))
    }

    pub fn storage(&self) -> &ReadableWritableListableStorage {
        &self.storage
    }

    pub fn location(&self) -> String {
        self.location.clone()
    }

    /// A store exists once its root document has been committed.
    pub fn exists(&self) -> Result<bool, EtlError> {
        Ok(self
            .storage
            .get(&store_key(ZARR_JSON)?)
            .map_err(storage_error)?
            .is_some())
    }

    pub fn consolidated(&self) -> Result<ConsolidatedMetadata, EtlError> {
        let bytes = self
            .storage
            .get(&store_key(ZARR_JSON)?)
            .map_err(storage_error)?
            .ok_or_else(|| EtlError::StoreNotFound(self.location()))?;
        ConsolidatedMetadata::parse(&bytes)
    }

    fn commit(&self, consolidated: &ConsolidatedMetadata) -> Result<(), EtlError> {
        let bytes = serde_json::to_vec_pretty(&consolidated.to_document())
            .map_err(|err| metadata_error(ZARR_JSON, err))?;
        self.storage
            .set(&store_key(ZARR_JSON)?, bytes.into())
            .map_err(storage_error)
    }

    fn open_array(&self, name: &str, entry: &Value) -> Result<StoredArray, EtlError> {
        let metadata: ArrayMetadata =
            serde_json::from_value(entry.clone()).map_err(|err| metadata_error(name, err))?;
        Array::new_with_metadata(self.storage.clone(), &format!("/{name}"), metadata)
            .map_err(zarr_error)
    }

    fn create_array(&self, var: &Variable, chunks: Vec<u64>) -> Result<StoredArray, EtlError> {
        let shape = var.data.shape().iter().map(|len| *len as u64).collect::<Vec<_>>();
        let chunk_grid: ChunkGrid = chunks
            .try_into()
            .map_err(|err| metadata_error(&var.name, err))?;
        let (data_type, fill_value) = zarr_type(&var.data);
        let gzip = GzipCodec::new(GZIP_LEVEL).map_err(zarr_error)?;
        ArrayBuilder::new(shape, data_type, chunk_grid, fill_value)
            .bytes_to_bytes_codecs(vec![Arc::new(gzip)])
            .dimension_names(Some(var.dims.iter().map(String::as_str)))
            .attributes(attrs_map(&var.attrs))
            .build(self.storage.clone(), &format!("/{}", var.name))
            .map_err(zarr_error)
    }

    /// Refreshes each array's own `zarr.json` from its committed entry. The
    /// root document stays authoritative, so a failure is only logged and
    /// the next commit writes the mirror again.
    fn mirror_array_metadata<'a>(
        &self,
        consolidated: &ConsolidatedMetadata,
        names: impl IntoIterator<Item = &'a str>,
    ) {
        for name in names {
            let mirrored = consolidated
                .entry(name)
                .and_then(|entry| self.open_array(name, entry))
                .and_then(|array| array.store_metadata().map_err(zarr_error));
            if let Err(err) = mirrored {
                warn!("could not refresh {name}/{ZARR_JSON} in {}: {err}", self.location);
            }
        }
    }

    pub fn read_array(&self, name: &str) -> Result<ArrayData, EtlError> {
        self.read_array_with(&self.consolidated()?, name)
    }

    fn read_array_with(&self, consolidated: &ConsolidatedMetadata, name: &str) -> Result<ArrayData, EtlError> {
        let entry = consolidated.entry(name)?;
        let layout = ArrayLayout::from_entry(name, entry)?;
        let array = self.open_array(name, entry)?;
        retrieve_values(&array, name, &layout)
    }

    pub fn read_variable(&self, name: &str) -> Result<Variable, EtlError> {
        self.read_variable_with(&self.consolidated()?, name)
    }

    fn read_variable_with(
        &self,
        consolidated: &ConsolidatedMetadata,
        name: &str,
    ) -> Result<Variable, EtlError> {
        let layout = consolidated.array(name)?;
        Ok(Variable {
            name: name.to_string(),
            dims: layout.dims,
            data: self.read_array_with(consolidated, name)?,
            attrs: layout.attrs,
        })
    }

    pub fn read_dataset(&self) -> Result<Dataset, EtlError> {
        let consolidated = self.consolidated()?;
        let variables = consolidated
            .array_names()
            .iter()
            .map(|name| self.read_variable_with(&consolidated, name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Dataset::new(consolidated.group_attrs(), variables))
    }

    /// Decoded time coordinate, in storage order.
    pub fn read_time_axis(&self) -> Result<Vec<NaiveDateTime>, EtlError> {
        let consolidated = self.consolidated()?;
        let attrs = consolidated.array_attrs("time")?;
        let units = attrs
            .get("units")
            .and_then(Value::as_str)
            .unwrap_or(TIME_UNITS);
        let encoding = TimeEncoding::parse(units)?;
        self.read_array_with(&consolidated, "time")?
            .to_f64_vec()
            .into_iter()
            .map(|value| seconds_to_datetime(encoding.to_epoch_seconds(value)))
            .collect()
    }

    /// `None` when the store has not been created yet.
    pub fn last_timestamp(&self) -> Result<Option<NaiveDateTime>, EtlError> {
        if !self.exists()? {
            return Ok(None);
        }
        Ok(self.read_time_axis()?.last().copied())
    }

    /// Creates the group from `dataset`. Leftovers of an earlier attempt that
    /// never committed are overwritten.
    pub fn write(&self, dataset: &Dataset, chunking: Chunking) -> Result<(), EtlError> {
        info!("creating store at {}", self.location);
        let mut metadata = BTreeMap::new();
        for var in &dataset.variables {
            let array = self.create_array(var, chunking.chunks_for(var))?;
            store_values(&array, &vec![0; var.dims.len()], &var.data)?;
            array.store_metadata().map_err(zarr_error)?;
            let entry = serde_json::to_value(array.metadata()).map_err(|err| metadata_error(&var.name, err))?;
            metadata.insert(var.name.clone(), entry);
        }
        let group = GroupBuilder::new()
            .attributes(attrs_map(&dataset.attrs))
            .build(self.storage.clone(), "/")
            .map_err(zarr_error)?;
        let group = serde_json::to_value(group.metadata()).map_err(|err| metadata_error(ZARR_JSON, err))?;
        self.commit(&ConsolidatedMetadata::new(group, metadata)?)
    }

    /// Extends every array that spans `dim` with `dataset`. Arrays without
    /// `dim` must match what is stored. Nothing is written until the whole
    /// dataset has been checked. The grown shapes are published only by the
    /// final root commit, so a failure before it leaves the committed
    /// arrays as they were.
    pub fn append(&self, dataset: &Dataset, dim: &str) -> Result<(), EtlError> {
        let mut consolidated = self.consolidated()?;
        let stored = consolidated.array_names().into_iter().collect::<BTreeSet<_>>();
        let incoming = dataset
            .variables
            .iter()
            .map(|var| var.name.clone())
            .collect::<BTreeSet<_>>();
        if stored != incoming {
            return Err(EtlError::SchemaMismatch(format!(
                "store holds {stored:?}, dataset holds {incoming:?}"
            )));
        }

        let mut extended = Vec::new();
        for var in &dataset.variables {
            let layout = consolidated.array(&var.name)?;
            if layout.dims != var.dims {
                return Err(EtlError::SchemaMismatch(format!(
                    "{} has dimensions {:?}",
                    var.name, var.dims
                )));
            }
            if layout.data_type != var.data.dtype() {
                return Err(EtlError::SchemaMismatch(format!(
                    "{} is stored as {} but arrived as {}",
                    var.name,
                    layout.data_type,
                    var.data.dtype()
                )));
            }
            match var.dims.iter().position(|name| name == dim) {
                Some(axis) => {
                    let shape = var.data.shape();
                    let fits = (0..shape.len()).all(|d| d == axis || shape[d] as u64 == layout.shape[d]);
                    if !fits {
                        return Err(EtlError::SchemaMismatch(format!(
                            "{} has shape {shape:?}, store has {:?}",
                            var.name, layout.shape
                        )));
                    }
                    extended.push((var, axis, layout.shape));
                }
                None => {
                    if self.read_array_with(&consolidated, &var.name)? != var.data {
                        return Err(EtlError::CoordinateMismatch {
                            coordinate: var.name.clone(),
                            left: self.location(),
                            right: "appended dataset".to_string(),
                        });
                    }
                }
            }
        }

        let mut grown_entries = Vec::with_capacity(extended.len());
        for (var, axis, mut shape) in extended {
            let mut start = vec![0; shape.len()];
            start[axis] = shape[axis];
            shape[axis] += var.data.shape()[axis] as u64;

            let mut entry = consolidated.entry(&var.name)?.clone();
            let Some(fields) = entry.as_object_mut() else {
                return Err(EtlError::Metadata(format!("{} metadata is not an object", var.name)));
            };
            fields.insert("shape".to_string(), json!(shape));
            let array = self.open_array(&var.name, &entry)?;
            store_values(&array, &start, &var.data)?;
            grown_entries.push((var.name.clone(), entry));
        }
        debug!("appended {} arrays along {dim}", grown_entries.len());

        let names = grown_entries
            .iter()
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        consolidated.metadata.extend(grown_entries);
        self.commit(&consolidated)?;
        self.mirror_array_metadata(&consolidated, names.iter().map(String::as_str));
        Ok(())
    }

    /// Keys stored under `array/`, relative to it and sorted.
    pub fn list_fragments(&self, array: &str) -> Result<Vec<String>, EtlError> {
        let prefix = store_prefix(array)?;
        let mut fragments = self
            .storage
            .list_prefix(&prefix)
            .map_err(storage_error)?
            .into_iter()
            .filter_map(|key| key.as_str().strip_prefix(prefix.as_str()).map(str::to_string))
            .collect::<Vec<_>>();
        fragments.sort();
        Ok(fragments)
    }

    /// Fragments a single-chunk `array` is made of under its committed
    /// layout: its metadata document and its one chunk.
    pub fn single_chunk_fragments(&self, array: &str) -> Result<Vec<String>, EtlError> {
        let consolidated = self.consolidated()?;
        let layout = consolidated.array(array)?;
        let stored = self.open_array(array, consolidated.entry(array)?)?;
        let chunk = stored.chunk_key(&vec![0; layout.shape.len()]);
        let prefix = format!("{array}/");
        let chunk = chunk
            .as_str()
            .strip_prefix(&prefix)
            .ok_or_else(|| EtlError::Metadata(format!("{array}: chunk key outside the array")))?;
        Ok(vec![ZARR_JSON.to_string(), chunk.to_string()])
    }

    /// Rewrites `array` as one chunk. The chunk goes under the other chunk
    /// key encoding, so the committed chunks stay readable until the root
    /// commit switches to it; a failure at any step leaves a readable store
    /// and the rewrite can simply run again. Returns the array length.
    pub fn rewrite_dimension_as_single_chunk(&self, array: &str) -> Result<u64, EtlError> {
        let mut consolidated = self.consolidated()?;
        let layout = consolidated.array(array)?;
        let data = self.read_array_with(&consolidated, array)?;

        let entry = consolidated.entry(array)?;
        let encoding = alternate_key_encoding(entry);
        let mut rewritten = entry.clone();
        let Some(fields) = rewritten.as_object_mut() else {
            return Err(EtlError::Metadata(format!("{array} metadata is not an object")));
        };
        let single = layout.shape.iter().map(|len| (*len).max(1)).collect::<Vec<_>>();
        fields.insert(
            "chunk_grid".to_string(),
            json!({ "name": "regular", "configuration": { "chunk_shape": single } }),
        );
        fields.insert("chunk_key_encoding".to_string(), encoding);

        let target = self.open_array(array, &rewritten)?;
        store_values(&target, &vec![0; layout.shape.len()], &data)?;
        consolidated.metadata.insert(array.to_string(), rewritten);
        self.commit(&consolidated)?;
        self.mirror_array_metadata(&consolidated, [array]);
        Ok(layout.len())
    }

    /// Deletes every fragment of `array` whose name is not in `keep`.
    pub fn remove_stale_fragments(&self, array: &str, keep: &[String]) -> Result<Vec<String>, EtlError> {
        let mut removed = Vec::new();
        for fragment in self.list_fragments(array)? {
            if keep.contains(&fragment) {
                continue;
            }
            let key = join_key(&[array, &fragment]);
            self.storage.erase(&store_key(&key)?).map_err(storage_error)?;
            removed.push(key);
        }
        Ok(removed)
    }
}
