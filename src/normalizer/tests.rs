use super::*;
use std::io::Write;

fn normalize(input: &str) -> Result<RecordSet, NormalizeError> {
    normalize_reader(input.as_bytes(), &NormalizeOptions::default())
}

#[test]
fn test_name_age_scenario() {
    let records = normalize("name,age\nAlice,30\nBob,\n").unwrap();

    assert_eq!(records.schema().type_of("name"), Some(ColumnType::String));
    assert_eq!(records.schema().type_of("age"), Some(ColumnType::Integer));
    assert_eq!(records.len(), 2);
    assert_eq!(records.get(0, "age"), Some(&DatabaseValue::Integer(30)));
    assert_eq!(records.get(1, "age"), Some(&DatabaseValue::Null));
    assert_eq!(
        records.get(1, "name"),
        Some(&DatabaseValue::Text("Bob".to_string()))
    );
    assert!(records.warnings().is_empty());
}

#[test]
fn test_extra_column_cites_row_two() {
    let err = normalize("a,b\n1,2,3\n").unwrap_err();
    match err {
        NormalizeError::MalformedInput { row, .. } => assert_eq!(row, 2),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_short_row_later_in_file() {
    let err = normalize("a,b\n1,2\n3,4\n5\n").unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedInput { row: 4, .. }));
}

#[test]
fn test_schema_width_equals_header_length() {
    let records = normalize("a,b,c,d\n1,2,3,4\n").unwrap();
    assert_eq!(records.schema().len(), 4);
}

#[test]
fn test_all_types_inferred() {
    let records = normalize(
        "flag,count,ratio,label\ntrue,1,0.5,x\nFALSE,2,1,y\n,3,2.25,\n",
    )
    .unwrap();
    let types: Vec<ColumnType> = records
        .schema()
        .columns()
        .iter()
        .map(|c| c.column_type)
        .collect();
    assert_eq!(
        types,
        vec![
            ColumnType::Boolean,
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::String
        ]
    );
    assert_eq!(records.get(1, "ratio"), Some(&DatabaseValue::Float(1.0)));
    assert_eq!(records.get(2, "flag"), Some(&DatabaseValue::Null));
    assert_eq!(records.get(2, "label"), Some(&DatabaseValue::Null));
}

#[test]
fn test_empty_column_is_nullable_string() {
    let records = normalize("a,b\n1,\n2,  \n").unwrap();
    assert_eq!(records.schema().type_of("b"), Some(ColumnType::String));
    assert!(records.rows().iter().all(|r| r[1].is_null()));
}

#[test]
fn test_header_names_trimmed_and_filled() {
    let records = normalize(" id ,,name\n1,2,x\n").unwrap();
    let names: Vec<&str> = records.schema().names().collect();
    assert_eq!(names, vec!["id", "column_2", "name"]);
}

#[test]
fn test_duplicate_header_is_malformed() {
    let err = normalize("a, a\n1,2\n").unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedInput { row: 1, .. }));
}

#[test]
fn test_empty_input_is_malformed() {
    assert!(matches!(
        normalize("").unwrap_err(),
        NormalizeError::MalformedInput { .. }
    ));
}

#[test]
fn test_header_only_file_has_no_rows() {
    let records = normalize("a,b\n").unwrap();
    assert!(records.is_empty());
    assert_eq!(records.schema().type_of("a"), Some(ColumnType::String));
}

#[test]
fn test_without_header_uses_positional_names() {
    let options = NormalizeOptions {
        format: FormatHint {
            delimiter: b';',
            has_header: false,
        },
        ..Default::default()
    };
    let records = normalize_reader("1;x\n2;y\n".as_bytes(), &options).unwrap();
    assert_eq!(
        records.schema().names().collect::<Vec<_>>(),
        vec!["column_1", "column_2"]
    );
    assert_eq!(records.len(), 2);
    assert_eq!(records.get(0, "column_1"), Some(&DatabaseValue::Integer(1)));
}

#[test]
fn test_quoted_fields() {
    let records = normalize("name,note\n\"Smith, J\",\"said \"\"hi\"\"\"\n").unwrap();
    assert_eq!(
        records.get(0, "name"),
        Some(&DatabaseValue::Text("Smith, J".to_string()))
    );
    assert_eq!(
        records.get(0, "note"),
        Some(&DatabaseValue::Text("said \"hi\"".to_string()))
    );
}

#[test]
fn test_string_cells_keep_original_text() {
    let records = normalize("code\n 007 \nabc\n").unwrap();
    assert_eq!(
        records.get(0, "code"),
        Some(&DatabaseValue::Text(" 007 ".to_string()))
    );
}

#[test]
fn test_blank_lines_are_skipped() {
    let records = normalize("a,b\n1,2\n\n3,4\n").unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_whitespace_line_is_null_in_single_column_file() {
    let records = normalize("name\nAlice\n   \nBob\n").unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records.get(1, "name"), Some(&DatabaseValue::Null));
    assert_eq!(
        records.get(2, "name"),
        Some(&DatabaseValue::Text("Bob".to_string()))
    );
}

#[test]
fn test_whitespace_line_is_blank_in_wider_file() {
    let records = normalize("a,b\n1,2\n  \n3,4\n").unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_row_numbers_count_blank_lines() {
    let err = normalize("a,b\n\n1,2,3\n").unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedInput { row: 3, .. }));

    let err = normalize("a,b\n1,2\n   \n\n3\n").unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedInput { row: 5, .. }));

    let records = normalize("id,age\n1,30\n\n2,41\n3,n/a\n").unwrap();
    assert_eq!(records.warnings()[0].row, 5);
}

#[test]
fn test_header_after_blank_lines_keeps_its_line() {
    let err = normalize("\n\na,a\n1,2\n").unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedInput { row: 3, .. }));
}

#[test]
fn test_invalid_utf8_is_malformed() {
    let mut bytes = b"a\nok\n".to_vec();
    bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
    let err = normalize_reader(bytes.as_slice(), &NormalizeOptions::default()).unwrap_err();
    assert!(matches!(err, NormalizeError::MalformedInput { row: 3, .. }));
}

#[test]
fn test_loosening_produces_warning() {
    let records = normalize("id,age\n1,30\n2,41\n3,n/a\n").unwrap();
    assert_eq!(records.schema().type_of("age"), Some(ColumnType::String));
    assert_eq!(
        records.warnings(),
        &[TypeWarning {
            column: "age".to_string(),
            suggested: ColumnType::Integer,
            value: "n/a".to_string(),
            row: 4,
        }]
    );
    assert_eq!(
        records.get(0, "age"),
        Some(&DatabaseValue::Text("30".to_string()))
    );
}

#[test]
fn test_strict_types_rejects_loosening() {
    let options = NormalizeOptions {
        strict_types: true,
        ..Default::default()
    };
    let err = normalize_reader("age\n30\n41\nn/a\n".as_bytes(), &options).unwrap_err();
    match err {
        NormalizeError::TypeInference { column, reason } => {
            assert_eq!(column, "age");
            assert!(reason.contains("n/a"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_integer_float_mix_is_not_reported() {
    let records = normalize("x\n1\n2.5\n").unwrap();
    assert_eq!(records.schema().type_of("x"), Some(ColumnType::Float));
    assert!(records.warnings().is_empty());
}

#[test]
fn test_deduplicate_keeps_first_occurrence() {
    let options = NormalizeOptions {
        deduplicate: true,
        ..Default::default()
    };
    let records =
        normalize_reader("a,b\n1,x\n2,y\n1,x\n1.0,x\n".as_bytes(), &options).unwrap();
    // 1, 2, 1, 1.0 widen to float, so the last row duplicates the first too
    assert_eq!(records.len(), 2);
    assert_eq!(records.get(1, "b"), Some(&DatabaseValue::Text("y".to_string())));
}

#[test]
fn test_duplicates_kept_by_default() {
    let records = normalize("a\n1\n1\n").unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_inference_is_deterministic() {
    let input = "a,b,c\n1,true,x\n2.5,false,\n,true,z\n";
    assert_eq!(normalize(input).unwrap(), normalize(input).unwrap());
}

#[test]
fn test_normalize_file_and_missing_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "name,age").unwrap();
    writeln!(file, "Alice,30").unwrap();
    file.flush().unwrap();

    let records = normalize_file(file.path(), &NormalizeOptions::default()).unwrap();
    assert_eq!(records.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let err = normalize_file(dir.path().join("missing.csv"), &NormalizeOptions::default())
        .unwrap_err();
    assert!(matches!(err, NormalizeError::Io(_)));
}

#[test]
fn test_record_set_new_validates_rows() {
    let schema = Schema::new(vec![ColumnDescriptor::new("n", ColumnType::Integer)]);
    assert!(RecordSet::new(schema.clone(), vec![vec![DatabaseValue::Integer(1)]]).is_ok());
    assert!(matches!(
        RecordSet::new(schema.clone(), vec![vec![DatabaseValue::from("x")]]),
        Err(NormalizeError::TypeInference { .. })
    ));
    assert!(matches!(
        RecordSet::new(schema, vec![vec![]]),
        Err(NormalizeError::MalformedInput { row: 1, .. })
    ));
}
