mod common;

use std::path::PathBuf;

use common::TestWorkspace;
use encoding_rs::WINDOWS_1252;
use pg_import::extract::{ExtractOptions, RawValue, SourceFormat, extract};
use proptest::prelude::*;

fn collect(extraction: pg_import::extract::Extraction) -> Vec<Vec<RawValue>> {
    extraction
        .rows
        .map(|row| row.expect("row").values)
        .collect()
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn text(value: &str) -> RawValue {
    RawValue::Text(value.to_string())
}

#[test]
fn csv_with_header_yields_rows_in_order() {
    let workspace = TestWorkspace::new();
    let path = workspace.write(
        "people.csv",
        "email,age,city\na@x.com,30,Oslo\n\nb@x.com,41,Bergen\nc@x.com,,Molde\n",
    );
    let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
    assert_eq!(extraction.format, SourceFormat::Csv);
    assert!(extraction.has_headers);
    assert_eq!(extraction.headers, vec!["email", "age", "city"]);
    assert_eq!(extraction.delimiter, Some(b','));

    let rows = extraction
        .rows
        .map(|row| row.expect("row"))
        .collect::<Vec<_>>();
    assert_eq!(
        rows.iter().map(|r| r.ordinal).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(rows[2].values, vec![text("c@x.com"), RawValue::Null, text("Molde")]);
}

#[test]
fn headerless_csv_gets_generated_names() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("numbers.csv", "1,2.5,3\n4,5.5,6\n7,8.5,9\n");
    let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
    assert!(!extraction.has_headers);
    assert_eq!(extraction.headers, vec!["column_1", "column_2", "column_3"]);
    assert_eq!(collect(extraction).len(), 3);
}

#[test]
fn header_can_be_forced_off() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("names.csv", "name,city\nAnn,Oslo\n");
    let options = ExtractOptions {
        header: Some(false),
        ..ExtractOptions::default()
    };
    let extraction = extract(&path, &options).expect("extract");
    assert_eq!(extraction.headers, vec!["column_1", "column_2"]);
    let rows = collect(extraction);
    assert_eq!(rows[0], vec![text("name"), text("city")]);
}

#[test]
fn semicolon_latin1_file_is_decoded() {
    let workspace = TestWorkspace::new();
    let (bytes, _, _) = WINDOWS_1252.encode("navn;by;beløp\nSøren;Århus;1.234,50\nÅse;Tromsø;12\n");
    let path = workspace.write_bytes("nordic.csv", &bytes);
    let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
    assert_eq!(extraction.delimiter, Some(b';'));
    assert_eq!(extraction.encoding, Some("windows-1252"));
    assert_eq!(extraction.headers, vec!["navn", "by", "beløp"]);
    let rows = collect(extraction);
    assert_eq!(rows[0][1], text("Århus"));
    assert_eq!(rows[1][1], text("Tromsø"));
}

#[test]
fn short_rows_are_padded_and_long_rows_truncated() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("ragged.csv", "a,b,c\n1,2\n3,4,5,6\n");
    let options = ExtractOptions {
        header: Some(true),
        ..ExtractOptions::default()
    };
    let rows = collect(extract(&path, &options).expect("extract"));
    assert_eq!(rows[0], vec![text("1"), text("2"), RawValue::Null]);
    assert_eq!(rows[1], vec![text("3"), text("4"), text("5")]);
}

#[test]
fn missing_value_tokens_become_null() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("gaps.csv", "name,score\nAnn,N/A\nBo,null\nCy,#N/A\nDi, \n");
    let rows = collect(extract(&path, &ExtractOptions::default()).expect("extract"));
    assert!(rows.iter().all(|row| row[1] == RawValue::Null));
}

#[test]
fn json_records_are_flattened_in_first_seen_order() {
    let workspace = TestWorkspace::new();
    let path = workspace.write(
        "people.json",
        r#"{
            "generated": "2024-01-01",
            "people": [
                {"email": "a@x.com", "address": {"city": "Oslo", "zip": "0150"}, "tags": ["a", "b"]},
                {"email": "b@x.com", "age": 41}
            ],
            "pets": [{"name": "Rex"}]
        }"#,
    );
    let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
    assert_eq!(extraction.format, SourceFormat::Json);
    assert_eq!(
        extraction.headers,
        vec!["email", "address_city", "address_zip", "tags", "age"]
    );
    let rows = collect(extraction);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][3], text(r#"["a","b"]"#));
    assert_eq!(rows[0][4], RawValue::Null);
    assert_eq!(rows[1][4], RawValue::Integer(41));
}

#[test]
fn json_array_of_scalars_is_a_parse_error() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("bad.json", "[1, 2, 3]");
    let err = extract(&path, &ExtractOptions::default()).unwrap_err();
    assert!(err.to_string().contains("not an object"), "{err}");
}

#[test]
fn unknown_extension_and_missing_file_are_parse_errors() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("data.bin", "a,b\n1,2\n");
    assert!(extract(&path, &ExtractOptions::default()).is_err());
    let declared = ExtractOptions {
        format: Some(SourceFormat::Csv),
        ..ExtractOptions::default()
    };
    assert!(extract(&path, &declared).is_ok());
    assert!(extract(&workspace.path().join("absent.csv"), &declared).is_err());
}

#[test]
fn json_keys_that_flatten_to_the_same_name_are_suffixed() {
    let workspace = TestWorkspace::new();
    let path = workspace.write(
        "clash.json",
        r#"[{"a_b": 1, "a": {"b": 2}}, {"a": {"b": 3}}]"#,
    );
    let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
    assert_eq!(extraction.headers, vec!["a_b", "a_b_2"]);
    let rows = collect(extraction);
    assert_eq!(rows[0], vec![RawValue::Integer(1), RawValue::Integer(2)]);
    assert_eq!(rows[1], vec![RawValue::Null, RawValue::Integer(3)]);
}

#[test]
fn empty_inputs_are_parse_errors() {
    let workspace = TestWorkspace::new();
    let empty_csv = workspace.write("empty.csv", "");
    let empty_json = workspace.write("empty.json", r#"{"people": []}"#);
    for path in [empty_csv, empty_json] {
        let err = extract(&path, &ExtractOptions::default()).unwrap_err();
        assert!(
            matches!(err, pg_import::error::ImportError::Parse { .. }),
            "{err}"
        );
        assert!(err.to_string().contains("input is empty"), "{err}");
    }
}

#[test]
fn csv_row_stream_knows_its_length() {
    let workspace = TestWorkspace::new();
    let path = workspace.write(
        "people.csv",
        "email,age\na@x.com,30\n\nb@x.com,31\nc@x.com,32\n",
    );
    let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
    assert_eq!(extraction.rows.size_hint(), (3, Some(3)));
}

#[test]
fn workbook_reads_first_sheet_with_detected_header() {
    let path = fixture_path("people.xlsx");
    let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
    assert_eq!(extraction.format, SourceFormat::Excel);
    assert!(extraction.has_headers);
    assert_eq!(extraction.headers, vec!["Email", "Age", "Active", "Joined"]);

    let rows = extraction
        .rows
        .map(|row| row.expect("row"))
        .collect::<Vec<_>>();
    assert_eq!(
        rows.iter().map(|r| r.ordinal).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(
        rows[0].values,
        vec![
            text("a@x.com"),
            RawValue::Integer(30),
            RawValue::Boolean(true),
            text("2024-01-05"),
        ]
    );
    assert_eq!(rows[1].values[1], RawValue::Float(41.5));
    assert!(
        rows.iter().all(|row| row.values[0] != text("ignored")),
        "second worksheet must not be read"
    );
}

#[test]
fn workbook_header_can_be_forced_off() {
    let options = ExtractOptions {
        header: Some(false),
        ..ExtractOptions::default()
    };
    let extraction = extract(&fixture_path("people.xlsx"), &options).expect("extract");
    assert_eq!(
        extraction.headers,
        vec!["column_1", "column_2", "column_3", "column_4"]
    );
    let rows = collect(extraction);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0][0], text("Email"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn csv_yields_exactly_one_row_per_record(values in prop::collection::vec(0u32..100_000, 1..60)) {
        let workspace = TestWorkspace::new();
        let mut contents = String::from("id,label\n");
        for (idx, value) in values.iter().enumerate() {
            contents.push_str(&format!("{value},item-{idx}\n"));
        }
        let path = workspace.write("rows.csv", &contents);
        let extraction = extract(&path, &ExtractOptions::default()).expect("extract");
        let rows = extraction.rows.map(|row| row.expect("row")).collect::<Vec<_>>();
        prop_assert_eq!(rows.len(), values.len());
        for (idx, row) in rows.iter().enumerate() {
            prop_assert_eq!(row.ordinal, idx + 1);
            prop_assert_eq!(&row.values[1], &RawValue::Text(format!("item-{idx}")));
        }
    }
}
