//! STAC item and collection documents describing the stores.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use zarrs::storage::{ListableStorageTraits, ReadableStorageTraits};

use crate::dataset::Attrs;
use crate::domain::{FIRST_PERIOD, Kind};
use crate::error::EtlError;
use crate::storage::{
    Protocol, ReadableWritableListableStorage, StorageOptions, join_key, open_storage,
    storage_error, store_key, store_prefix,
};
use crate::store::{ZARR_JSON, ZarrStore};

pub const STAC_VERSION: &str = "1.0.0";
pub const DATACUBE_EXTENSION: &str = "https://stac-extensions.github.io/datacube/v2.0.0/schema.json";
pub const COLLECTION_ID: &str = "era5-pds";
pub const ZARR_MEDIA_TYPE: &str = "application/vnd+zarr";

const GLOBAL_BBOX: [f64; 4] = [-180.0, -90.0, 180.0, 90.0];
const STAC_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const KEYWORDS: [&str; 6] = [
    "ERA5",
    "ECMWF",
    "Precipitation",
    "Temperature",
    "Reanalysis",
    "Weather",
];
const THUMBNAIL_HREF: &str = "https://datastore.copernicus-climate.eu/c3s/published-forms-v2/c3sprod_clone/reanalysis-era5-pressure-levels/overview.jpg";

#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub name: String,
    pub roles: Vec<String>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    #[serde(rename = "type")]
    pub object_type: String,
    pub stac_version: String,
    pub stac_extensions: Vec<String>,
    pub id: String,
    pub geometry: Value,
    pub bbox: [f64; 4],
    pub properties: BTreeMap<String, Value>,
    pub links: Vec<Link>,
    pub assets: BTreeMap<String, Asset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    #[serde(rename = "type")]
    pub object_type: String,
    pub stac_version: String,
    pub stac_extensions: Vec<String>,
    pub id: String,
    pub title: String,
    pub description: String,
    pub license: String,
    pub keywords: Vec<String>,
    pub providers: Vec<Provider>,
    pub extent: Value,
    pub links: Vec<Link>,
    pub assets: BTreeMap<String, Asset>,
    pub summaries: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

fn global_polygon() -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[
            [180.0, -90.0],
            [180.0, 90.0],
            [-180.0, 90.0],
            [-180.0, -90.0],
            [180.0, -90.0]
        ]]
    })
}

fn format_time(value: NaiveDateTime) -> String {
    value.format(STAC_TIME_FORMAT).to_string()
}

/// ISO 8601 duration in the `P0DT1H0M0S` form.
fn iso_duration(secs: i64) -> String {
    let days = secs.div_euclid(86_400);
    let rest = secs.rem_euclid(86_400);
    format!(
        "P{days}DT{}H{}M{}S",
        rest / 3_600,
        (rest % 3_600) / 60,
        rest % 60
    )
}

/// Common spacing of `values`, if they are evenly spaced.
fn uniform_step(values: &[f64]) -> Option<f64> {
    let step = values.get(1)? - values.first()?;
    values
        .windows(2)
        .all(|pair| ((pair[1] - pair[0]) - step).abs() < 1e-6)
        .then_some(step)
}

fn extent_of(values: &[f64]) -> Value {
    if values.is_empty() {
        return json!([null, null]);
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    json!([min, max])
}

fn text_attr(attrs: &Attrs, key: &str) -> Option<String> {
    attrs.get(key).and_then(Value::as_str).map(str::to_string)
}

/// `cube:dimensions` and `cube:variables` for the arrays of `store`.
pub fn datacube(store: &ZarrStore) -> Result<BTreeMap<String, Value>, EtlError> {
    let consolidated = store.consolidated()?;
    let mut dimensions = serde_json::Map::new();
    let mut variables = serde_json::Map::new();

    for name in consolidated.array_names() {
        let layout = consolidated.array(&name)?;
        let dims = layout.dims;
        let attrs = layout.attrs;
        let is_coordinate = dims.len() == 1 && dims[0] == name;
        if is_coordinate {
            continue;
        }
        let mut entry = serde_json::Map::new();
        entry.insert("dimensions".to_string(), json!(dims));
        entry.insert("type".to_string(), json!("data"));
        entry.insert("shape".to_string(), json!(layout.shape));
        if let Some(description) = text_attr(&attrs, "long_name") {
            entry.insert("description".to_string(), json!(description));
        }
        if let Some(unit) = text_attr(&attrs, "units") {
            entry.insert("unit".to_string(), json!(unit));
        }
        entry.insert("attrs".to_string(), json!(attrs));
        variables.insert(name.clone(), Value::Object(entry));

        for (dim, len) in dims.iter().zip(&layout.shape) {
            if !consolidated.has_array(dim) && !dimensions.contains_key(dim) {
                dimensions.insert(
                    dim.clone(),
                    json!({ "type": "count", "values": (0..*len).collect::<Vec<_>>() }),
                );
            }
        }
    }

    let times = store.read_time_axis()?;
    let step = uniform_step(
        &times
            .iter()
            .map(|ts| ts.and_utc().timestamp() as f64)
            .collect::<Vec<_>>(),
    );
    let mut time = serde_json::Map::new();
    time.insert("type".to_string(), json!("temporal"));
    time.insert(
        "extent".to_string(),
        json!([times.first().map(|ts| format_time(*ts)), times.last().map(|ts| format_time(*ts))]),
    );
    if let Some(step) = step {
        time.insert("step".to_string(), json!(iso_duration(step as i64)));
    }
    dimensions.insert("time".to_string(), Value::Object(time));

    for (dim, axis) in [("lon", "x"), ("lat", "y")] {
        let attrs = consolidated.array_attrs(dim)?;
        let values = store.read_array(dim)?.to_f64_vec();
        let mut entry = serde_json::Map::new();
        entry.insert("type".to_string(), json!("spatial"));
        entry.insert("axis".to_string(), json!(axis));
        entry.insert("extent".to_string(), extent_of(&values));
        if let Some(step) = uniform_step(&values) {
            entry.insert("step".to_string(), json!(step));
        }
        if let Some(description) = text_attr(&attrs, "long_name") {
            entry.insert("description".to_string(), json!(description));
        }
        entry.insert("reference_system".to_string(), json!("epsg:4326"));
        dimensions.insert(dim.to_string(), Value::Object(entry));
    }

    let mut cube = BTreeMap::new();
    cube.insert("cube:dimensions".to_string(), Value::Object(dimensions));
    cube.insert("cube:variables".to_string(), Value::Object(variables));
    Ok(cube)
}

/// One item per store. The `data` asset points at the whole store; every
/// data variable gets its own asset, titled with its long name.
pub fn create_item(
    kind: Kind,
    path: &str,
    protocol: Protocol,
    store: &ZarrStore,
    storage_options: &StorageOptions,
) -> Result<Item, EtlError> {
    let times = store.read_time_axis()?;
    let mut properties = datacube(store)?;
    properties.insert("datetime".to_string(), Value::Null);
    properties.insert(
        "start_datetime".to_string(),
        json!(times.first().map(|ts| format_time(*ts))),
    );
    properties.insert(
        "end_datetime".to_string(),
        json!(times.last().map(|ts| format_time(*ts))),
    );
    properties.insert("era5:kind".to_string(), json!(kind.as_str()));

    let mut open_options = serde_json::Map::new();
    if let Some(account) = &storage_options.account_name {
        open_options.insert("account_name".to_string(), json!(account));
    }
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert(
        "xarray:open_kwargs".to_string(),
        json!({
            "engine": "zarr",
            "chunks": {},
            "consolidated": true,
            "storage_options": Value::Object(open_options),
        }),
    );
    let href = format!("{protocol}://{path}");
    let data_asset = |title: String| Asset {
        href: href.clone(),
        title: Some(title),
        media_type: ZARR_MEDIA_TYPE.to_string(),
        roles: vec!["data".to_string()],
        extra_fields: extra_fields.clone(),
    };

    let consolidated = store.consolidated()?;
    let title = text_attr(&consolidated.group_attrs(), "title")
        .unwrap_or_else(|| format!("ERA5 {kind}"));
    let mut assets = BTreeMap::new();
    assets.insert("data".to_string(), data_asset(title));
    for name in consolidated.array_names() {
        let layout = consolidated.array(&name)?;
        if layout.dims.len() == 1 && layout.dims[0] == name {
            continue;
        }
        let title = text_attr(&layout.attrs, "long_name").unwrap_or_else(|| name.clone());
        assets.insert(name, data_asset(title));
    }

    Ok(Item {
        object_type: "Feature".to_string(),
        stac_version: STAC_VERSION.to_string(),
        stac_extensions: vec![DATACUBE_EXTENSION.to_string()],
        id: format!("era5-{kind}"),
        geometry: global_polygon(),
        bbox: GLOBAL_BBOX,
        properties,
        links: Vec::new(),
        assets,
    })
}

/// Store names (`<name>.zarr`) directly under a storage root. Only the
/// top level is listed, never the chunks inside the stores.
pub fn list_stores(storage: &ReadableWritableListableStorage) -> Result<Vec<String>, EtlError> {
    let listing = storage.list_dir(&store_prefix("")?).map_err(storage_error)?;
    let mut names = Vec::new();
    for prefix in listing.prefixes() {
        let name = prefix.as_str().trim_end_matches('/');
        if !name.ends_with(".zarr") {
            continue;
        }
        let root = store_key(&join_key(&[name, ZARR_JSON]))?;
        if storage.get(&root).map_err(storage_error)?.is_some() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Collection over every store under `root_path`.
pub fn create_collection(
    root_path: &str,
    protocol: Protocol,
    storage_options: &StorageOptions,
    extra_fields: BTreeMap<String, Value>,
) -> Result<Collection, EtlError> {
    let root = open_storage(protocol, root_path, storage_options)?;
    let mut items = Vec::new();
    for name in list_stores(&root)? {
        let kind = match name.parse::<Kind>() {
            Ok(kind) => kind,
            Err(_) => {
                warn!("skipping store {name}: not named after a kind");
                continue;
            }
        };
        let path = format!("{}/{name}", root_path.trim_end_matches('/'));
        debug!("describing {path}");
        let store = ZarrStore::open(protocol, &path, storage_options)?;
        items.push(create_item(kind, &path, protocol, &store, storage_options)?);
    }

    let mut fields = collection_datacube(&items);
    fields.extend(extra_fields);

    let kinds = items
        .iter()
        .filter_map(|item| item.properties.get("era5:kind").cloned())
        .collect::<Vec<_>>();
    let mut summaries = BTreeMap::new();
    summaries.insert("era5:kind".to_string(), Value::Array(kinds));

    let mut assets = BTreeMap::new();
    assets.insert(
        "thumbnail".to_string(),
        Asset {
            href: THUMBNAIL_HREF.to_string(),
            title: Some("Thumbnail".to_string()),
            media_type: "image/jpeg".to_string(),
            roles: vec!["thumbnail".to_string()],
            extra_fields: BTreeMap::new(),
        },
    );

    Ok(Collection {
        object_type: "Collection".to_string(),
        stac_version: STAC_VERSION.to_string(),
        stac_extensions: vec![DATACUBE_EXTENSION.to_string()],
        id: COLLECTION_ID.to_string(),
        title: "ERA5 - PDS".to_string(),
        description: "Hourly ERA5 reanalysis on single levels, as Zarr stores of forecast and analysis variables.".to_string(),
        license: "proprietary".to_string(),
        keywords: KEYWORDS.iter().map(|word| word.to_string()).collect(),
        providers: vec![
            Provider {
                name: "ECMWF".to_string(),
                roles: vec!["producer".to_string(), "licensor".to_string()],
                url: "https://www.ecmwf.int/".to_string(),
            },
            Provider {
                name: "Planet OS".to_string(),
                roles: vec!["processor".to_string()],
                url: "https://planetos.com/".to_string(),
            },
        ],
        extent: json!({
            "spatial": { "bbox": [GLOBAL_BBOX] },
            "temporal": { "interval": [[format_time(FIRST_PERIOD.first_hour()), null]] }
        }),
        links: collection_links(),
        assets,
        summaries,
        extra_fields: fields,
    })
}

fn collection_links() -> Vec<Link> {
    vec![
        Link {
            rel: "license".to_string(),
            href: "https://apps.ecmwf.int/datasets/licences/copernicus/".to_string(),
            media_type: "application/pdf".to_string(),
            title: "License to Use Copernicus Products".to_string(),
        },
        Link {
            rel: "describedby".to_string(),
            href: "https://confluence.ecmwf.int/display/CKB/ERA5".to_string(),
            media_type: "text/html".to_string(),
            title: "Project homepage".to_string(),
        },
        Link {
            rel: "describedby".to_string(),
            href: "https://confluence.ecmwf.int/display/CKB/How+to+acknowledge+and+cite+a+Climate+Data+Store+%28CDS%29+catalogue+entry+and+the+data+published+as+part+of+it".to_string(),
            media_type: "text/html".to_string(),
            title: "How to cite".to_string(),
        },
    ]
}

/// Merges item datacubes: the time extent is left open and leading
/// (time) lengths become null since they grow every month.
pub fn collection_datacube(items: &[Item]) -> BTreeMap<String, Value> {
    let mut dimensions = serde_json::Map::new();
    let mut variables = serde_json::Map::new();
    for item in items {
        if let Some(Value::Object(dims)) = item.properties.get("cube:dimensions") {
            dimensions.extend(dims.clone());
        }
        if let Some(Value::Object(vars)) = item.properties.get("cube:variables") {
            variables.extend(vars.clone());
        }
    }
    if let Some(Value::Object(time)) = dimensions.get_mut("time") {
        time.insert(
            "extent".to_string(),
            json!([format_time(FIRST_PERIOD.first_hour()), null]),
        );
    }
    for variable in variables.values_mut() {
        if let Some(Value::Array(shape)) = variable.get_mut("shape") {
            if let Some(first) = shape.first_mut() {
                *first = Value::Null;
            }
        }
    }

    let mut cube = BTreeMap::new();
    cube.insert("cube:dimensions".to_string(), Value::Object(dimensions));
    cube.insert("cube:variables".to_string(), Value::Object(variables));
    cube
}

/// Parses repeated `key=value` arguments.
pub fn parse_extra_fields(pairs: &[String]) -> Result<BTreeMap<String, Value>, EtlError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), Value::from(value)))
                .ok_or_else(|| EtlError::InvalidExtraField(pair.clone()))
        })
        .collect()
}
