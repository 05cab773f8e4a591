use assert_matches::assert_matches;

use era5_etl::domain::{FIRST_PERIOD, Kind, Period, is_day_complete, sentinel_last_timestamp};
use era5_etl::error::EtlError;
use era5_etl::schema::{attributes_for, canonical_for_request, has_time_bounds};

#[test]
fn every_requested_variable_has_a_schema_record() {
    for kind in Kind::ALL {
        for request in kind.archive_variables() {
            let canonical = canonical_for_request(request)
                .unwrap_or_else(|| panic!("{request} has no canonical name"));
            assert!(attributes_for(canonical).is_some(), "{canonical}");
        }
    }
}

#[test]
fn only_forecast_variables_are_bounded() {
    let bounded = |kind: Kind| {
        kind.archive_variables()
            .iter()
            .filter_map(|request| canonical_for_request(request))
            .filter(|canonical| has_time_bounds(canonical))
            .count()
    };
    assert_eq!(bounded(Kind::Forecast), 4);
    assert_eq!(bounded(Kind::Analysis), 0);
}

#[test]
fn kind_names_and_paths() {
    assert_eq!(Kind::Forecast.to_string(), "forecast");
    assert_eq!(Kind::Analysis.default_output_path(), "era5/analysis.zarr");
    assert_eq!("abfs://era5/analysis.zarr".parse::<Kind>().unwrap(), Kind::Analysis);
    assert_matches!("surface".parse::<Kind>(), Err(EtlError::InvalidKind(_)));
}

#[test]
fn periods_round_trip_through_display() {
    let period: Period = "2021-9".parse().unwrap();
    assert_eq!(period.to_string(), "2021-09");
    assert_eq!(period.to_string().parse::<Period>().unwrap(), period);
    assert_eq!(
        Period::range_inclusive(Period::new(2020, 11).unwrap(), Period::new(2021, 2).unwrap())
            .iter()
            .map(Period::to_string)
            .collect::<Vec<_>>(),
        vec!["2020-11", "2020-12", "2021-01", "2021-02"]
    );
    assert!(Period::range_inclusive(Period::new(2021, 2).unwrap(), Period::new(2020, 11).unwrap()).is_empty());
}

#[test]
fn sentinel_is_not_day_complete_but_month_ends_are() {
    let sentinel = sentinel_last_timestamp(FIRST_PERIOD);
    assert!(!is_day_complete(sentinel));
    assert_eq!(Period::from_datetime(sentinel).next(), FIRST_PERIOD);
    assert!(is_day_complete(Period::new(2020, 2).unwrap().last_hour()));
}
