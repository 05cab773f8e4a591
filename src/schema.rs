//! Canonical naming and attribute tables.
//!
//! Archive files use short ECMWF identifiers (`t2m`, `longitude`, ...). The
//! published store uses the long CF-style names below, and every variable
//! carries a fixed attribute record.

use serde_json::Value;

use crate::dataset::Attrs;

/// Name of the synthesized interval-bounds variable.
pub const TIME_BOUNDS_VARIABLE: &str = "time1_bounds";

/// Trailing dimension of the bounds variable.
pub const BOUNDS_DIMENSION: &str = "nv";

/// Offset subtracted from each timestamp to form the bounds lower edge.
///
/// The archive describes these fields as "since previous post-processing",
/// which reads like a 24 hour window, but the published dataset has always
/// used 10800 s (3 h). Kept as-is; do not change without checking upstream.
pub const TIME_BOUNDS_OFFSET_SECS: i64 = 10_800;

pub const COORDINATES: [&str; 3] = ["lat", "lon", "time"];

const DATASET_ATTRS: [(&str, &str); 3] = [
    ("institution", "ECMWF"),
    ("source", "Reanalysis"),
    ("title", "ERA5 forecasts"),
];

/// Dataset attributes dropped on transform.
pub const PROVENANCE_ATTRS: [&str; 1] = ["history"];

pub fn dataset_attrs() -> Attrs {
    DATASET_ATTRS
        .iter()
        .map(|(key, value)| (key.to_string(), Value::from(*value)))
        .collect()
}

/// Archive short name to canonical name.
pub fn canonical_name(short: &str) -> Option<&'static str> {
    let name = match short {
        "sp" => "surface_air_pressure",
        "tp" => "precipitation_amount_1hour_Accumulation",
        "longitude" => "lon",
        "latitude" => "lat",
        "time" => "time",
        "ssrd" => {
            "integral_wrt_time_of_surface_direct_downwelling_shortwave_flux_in_air_1hour_Accumulation"
        }
        "mx2t" => "air_temperature_at_2_metres_1hour_Maximum",
        "mn2t" => "air_temperature_at_2_metres_1hour_Minimum",
        "v10" => "northward_wind_at_10_metres",
        "v100" => "northward_wind_at_100_metres",
        "u10" => "eastward_wind_at_10_metres",
        "u100" => "eastward_wind_at_100_metres",
        "t2m" => "air_temperature_at_2_metres",
        "sst" => "sea_surface_temperature",
        "d2m" => "dew_point_temperature_at_2_metres",
        "msl" => "air_pressure_at_mean_sea_level",
        _ => return None,
    };
    Some(name)
}

/// Archive request name (as listed per kind) to the canonical variable it
/// produces.
pub fn canonical_for_request(request: &str) -> Option<&'static str> {
    let name = match request {
        "100m_u_component_of_wind" => "eastward_wind_at_100_metres",
        "100m_v_component_of_wind" => "northward_wind_at_100_metres",
        "10m_u_component_of_wind" => "eastward_wind_at_10_metres",
        "10m_v_component_of_wind" => "northward_wind_at_10_metres",
        "2m_dewpoint_temperature" => "dew_point_temperature_at_2_metres",
        "2m_temperature" => "air_temperature_at_2_metres",
        "total_precipitation" => "precipitation_amount_1hour_Accumulation",
        "maximum_2m_temperature_since_previous_post_processing" => {
            "air_temperature_at_2_metres_1hour_Maximum"
        }
        "minimum_2m_temperature_since_previous_post_processing" => {
            "air_temperature_at_2_metres_1hour_Minimum"
        }
        "sea_surface_temperature" => "sea_surface_temperature",
        "surface_pressure" => "surface_air_pressure",
        "surface_solar_radiation_downwards" => {
            "integral_wrt_time_of_surface_direct_downwelling_shortwave_flux_in_air_1hour_Accumulation"
        }
        "mean_sea_level_pressure" => "air_pressure_at_mean_sea_level",
        _ => return None,
    };
    Some(name)
}

/// Accumulated or extremum-over-interval variables that get a bounds array.
pub fn has_time_bounds(canonical: &str) -> bool {
    matches!(
        canonical,
        "precipitation_amount_1hour_Accumulation"
            | "integral_wrt_time_of_surface_direct_downwelling_shortwave_flux_in_air_1hour_Accumulation"
            | "air_temperature_at_2_metres_1hour_Maximum"
            | "air_temperature_at_2_metres_1hour_Minimum"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableAttributes {
    pub long_name: Option<&'static str>,
    pub standard_name: &'static str,
    pub units: Option<&'static str>,
    pub name_cdm: Option<&'static str>,
    pub name_ecmwf: Option<&'static str>,
    pub short_name_ecmwf: Option<&'static str>,
    pub product_type: Option<&'static str>,
}

impl VariableAttributes {
    const fn data(
        long_name: &'static str,
        name_cdm: &'static str,
        product_type: &'static str,
        short_name_ecmwf: &'static str,
        standard_name: &'static str,
        units: &'static str,
    ) -> Self {
        Self {
            long_name: Some(long_name),
            standard_name,
            units: Some(units),
            name_cdm: Some(name_cdm),
            name_ecmwf: Some(long_name),
            short_name_ecmwf: Some(short_name_ecmwf),
            product_type: Some(product_type),
        }
    }

    const fn coordinate(
        long_name: Option<&'static str>,
        standard_name: &'static str,
        units: Option<&'static str>,
    ) -> Self {
        Self {
            long_name,
            standard_name,
            units,
            name_cdm: None,
            name_ecmwf: None,
            short_name_ecmwf: None,
            product_type: None,
        }
    }

    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        let mut put = |key: &str, value: Option<&str>| {
            if let Some(value) = value {
                attrs.insert(key.to_string(), Value::from(value));
            }
        };
        put("long_name", self.long_name);
        put("nameCDM", self.name_cdm);
        put("nameECMWF", self.name_ecmwf);
        put("product_type", self.product_type);
        put("shortNameECMWF", self.short_name_ecmwf);
        put("standard_name", Some(self.standard_name));
        put("units", self.units);
        attrs
    }
}

static PRECIPITATION: VariableAttributes = VariableAttributes::data(
    "Total precipitation",
    "Total_precipitation_1hour_Accumulation",
    "forecast",
    "tp",
    "precipitation_amount",
    "m",
);
static MAX_TEMPERATURE: VariableAttributes = VariableAttributes::data(
    "Maximum temperature at 2 metres since previous post-processing",
    "Maximum_temperature_at_2_metres_since_previous_post-processing_surface_1_Hour_2",
    "forecast",
    "mx2t",
    "air_temperature",
    "K",
);
static MIN_TEMPERATURE: VariableAttributes = VariableAttributes::data(
    "Minimum temperature at 2 metres since previous post-processing",
    "Minimum_temperature_at_2_metres_since_previous_post-processing_surface_1_Hour_2",
    "forecast",
    "mn2t",
    "air_temperature",
    "K",
);
static SOLAR_RADIATION: VariableAttributes = VariableAttributes::data(
    "Surface solar radiation downwards",
    "Surface_solar_radiation_downwards_surface_1_Hour_Accumulation",
    "forecast",
    "ssrd",
    "integral_wrt_time_of_surface_direct_downwelling_shortwave_flux_in_air",
    "J m**-2",
);
static SURFACE_PRESSURE: VariableAttributes = VariableAttributes::data(
    "Surface pressure",
    "Surface_pressure_surface",
    "analysis",
    "sp",
    "surface_air_pressure",
    "Pa",
);
static SEA_SURFACE_TEMPERATURE: VariableAttributes = VariableAttributes::data(
    "Sea surface temperature",
    "Sea_surface_temperature_surface",
    "analysis",
    "sst",
    "sea_surface_temperature",
    "K",
);
static EASTWARD_WIND_10M: VariableAttributes = VariableAttributes::data(
    "10 metre U wind component",
    "10_metre_U_wind_component_surface",
    "analysis",
    "10u",
    "eastward_wind",
    "m s**-1",
);
static AIR_TEMPERATURE: VariableAttributes = VariableAttributes::data(
    "2 metre temperature",
    "2_metre_temperature_surface",
    "analysis",
    "2t",
    "air_temperature",
    "K",
);
static EASTWARD_WIND_100M: VariableAttributes = VariableAttributes::data(
    "100 metre U wind component",
    "100_metre_U_wind_component_surface",
    "analysis",
    "100u",
    "eastward_wind",
    "m s**-1",
);
static NORTHWARD_WIND_10M: VariableAttributes = VariableAttributes::data(
    "10 metre V wind component",
    "10_metre_V_wind_component_surface",
    "analysis",
    "10v",
    "northward_wind",
    "m s**-1",
);
static NORTHWARD_WIND_100M: VariableAttributes = VariableAttributes::data(
    "100 metre V wind component",
    "100_metre_V_wind_component_surface",
    "analysis",
    "100v",
    "northward_wind",
    "m s**-1",
);
static DEW_POINT: VariableAttributes = VariableAttributes::data(
    "2 metre dewpoint temperature",
    "2_metre_dewpoint_temperature_surface",
    "analysis",
    "2d",
    "dew_point_temperature",
    "K",
);
static SEA_LEVEL_PRESSURE: VariableAttributes = VariableAttributes::data(
    "Mean sea level pressure",
    "Mean_sea_level_pressure_surface",
    "analysis",
    "msl",
    "air_pressure_at_mean_sea_level",
    "Pa",
);
static LONGITUDE: VariableAttributes =
    VariableAttributes::coordinate(Some("longitude"), "longitude", Some("degrees_east"));
static LATITUDE: VariableAttributes =
    VariableAttributes::coordinate(Some("latitude"), "latitude", Some("degrees_north"));
static TIME: VariableAttributes = VariableAttributes::coordinate(None, "time", None);

/// Attribute record for a canonical variable name.
pub fn attributes_for(canonical: &str) -> Option<&'static VariableAttributes> {
    let record = match canonical {
        "precipitation_amount_1hour_Accumulation" => &PRECIPITATION,
        "air_temperature_at_2_metres_1hour_Maximum" => &MAX_TEMPERATURE,
        "air_temperature_at_2_metres_1hour_Minimum" => &MIN_TEMPERATURE,
        "integral_wrt_time_of_surface_direct_downwelling_shortwave_flux_in_air_1hour_Accumulation" => {
            &SOLAR_RADIATION
        }
        "surface_air_pressure" => &SURFACE_PRESSURE,
        "sea_surface_temperature" => &SEA_SURFACE_TEMPERATURE,
        "eastward_wind_at_10_metres" => &EASTWARD_WIND_10M,
        "air_temperature_at_2_metres" => &AIR_TEMPERATURE,
        "eastward_wind_at_100_metres" => &EASTWARD_WIND_100M,
        "northward_wind_at_10_metres" => &NORTHWARD_WIND_10M,
        "northward_wind_at_100_metres" => &NORTHWARD_WIND_100M,
        "dew_point_temperature_at_2_metres" => &DEW_POINT,
        "air_pressure_at_mean_sea_level" => &SEA_LEVEL_PRESSURE,
        "lon" => &LONGITUDE,
        "lat" => &LATITUDE,
        "time" => &TIME,
        _ => return None,
    };
    Some(record)
}
