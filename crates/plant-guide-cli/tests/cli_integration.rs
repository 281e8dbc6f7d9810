use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const PLANTS_CSV: &str = "ID,Common Name,Scientific Name,Image URL,Risk Level\n\
                          1,Red Maple,Acer rubrum,http://x/img.png,Low\n\
                          2,Poison Ivy,Toxicodendron radicans,http://x/ivy.png,High\n";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn run_pg<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_pg"))
        .args(args)
        .env_remove("PLANT_GUIDE_STORE_DIR")
        .env_remove("PLANT_GUIDE_CSV")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pg binary: {err}"))
}

fn parse_success(output: &Output) -> Value {
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "pg command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    parse_success(&run_pg(args))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

#[test]
fn ingest_loads_rows_into_plant_guide_in_order() {
    let dir = unique_temp_dir("pg-ingest");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("plants.csv");
    write_file(&csv, PLANTS_CSV);

    let out = run_json([
        "--store-dir",
        path_str(&store_dir),
        "ingest",
        "--csv",
        path_str(&csv),
    ]);
    assert_eq!(as_str(&out, "contract_version"), "cli.v1");
    let report = &out["report"];
    assert_eq!(as_str(report, "collection"), "Plant_Guide");
    assert_eq!(as_u64(report, "rows"), 2);
    assert_eq!(as_u64(report, "inserted"), 2);
    assert_eq!(as_u64(report, "skipped_existing"), 0);
    assert_eq!(as_str(report, "source_sha256").len(), 64);

    let got = run_json([
        "--store-dir",
        path_str(&store_dir),
        "collections",
        "get",
        "--name",
        "Plant_Guide",
    ]);
    let documents = as_array(&got, "documents");
    let ids = documents.iter().map(|doc| as_str(doc, "id")).collect::<Vec<_>>();
    assert_eq!(ids, vec!["red_maple", "poison_ivy"]);
    assert_eq!(as_str(&documents[0], "document"), "Red Maple");
    assert_eq!(
        documents[0]["metadata"],
        serde_json::json!({
            "common_name": "Red Maple",
            "image_url": "http://x/img.png",
            "risk_level": "Low",
            "scientific_name": "Acer rubrum"
        })
    );
}

#[test]
fn ingest_creates_both_collections_but_fills_only_the_guide() {
    let dir = unique_temp_dir("pg-collections");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("plants.csv");
    write_file(&csv, PLANTS_CSV);

    run_json(["--store-dir", path_str(&store_dir), "ingest", "--csv", path_str(&csv)]);

    let listed = run_json(["--store-dir", path_str(&store_dir), "collections", "list"]);
    let collections = as_array(&listed, "collections");
    let summary = collections
        .iter()
        .map(|c| (as_str(c, "name").to_string(), as_u64(c, "documents")))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![("Plant_Guide".to_string(), 2), ("Reported_Plants".to_string(), 0)]
    );
}

#[test]
fn repeated_ingest_skips_existing_ids_and_records_runs() {
    let dir = unique_temp_dir("pg-repeat");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("plants.csv");
    write_file(&csv, PLANTS_CSV);

    run_json(["--store-dir", path_str(&store_dir), "ingest", "--csv", path_str(&csv)]);
    let second = run_json(["--store-dir", path_str(&store_dir), "ingest", "--csv", path_str(&csv)]);
    assert_eq!(as_u64(&second["report"], "inserted"), 0);
    assert_eq!(as_u64(&second["report"], "skipped_existing"), 2);

    let count = run_json([
        "--store-dir",
        path_str(&store_dir),
        "collections",
        "count",
        "--name",
        "Plant_Guide",
    ]);
    assert_eq!(as_u64(&count, "count"), 2);

    let runs = run_json(["--store-dir", path_str(&store_dir), "runs", "list"]);
    assert_eq!(as_array(&runs, "runs").len(), 2);
}

#[test]
fn banner_only_file_inserts_nothing() {
    let dir = unique_temp_dir("pg-banner");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("plants.csv");
    write_file(&csv, "ID,Common Name,Scientific Name,Image URL,Risk Level\n");

    let out = run_json(["--store-dir", path_str(&store_dir), "ingest", "--csv", path_str(&csv)]);
    assert_eq!(as_u64(&out["report"], "rows"), 0);
    assert_eq!(as_u64(&out["report"], "inserted"), 0);
}

#[test]
fn missing_csv_fails_with_path_in_error() {
    let dir = unique_temp_dir("pg-missing");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("does-not-exist.csv");

    let output = run_pg(["--store-dir", path_str(&store_dir), "ingest", "--csv", path_str(&csv)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does-not-exist.csv"), "stderr:\n{stderr}");
}

#[test]
fn malformed_row_aborts_without_partial_insert() {
    let dir = unique_temp_dir("pg-malformed");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("plants.csv");
    write_file(
        &csv,
        "banner\n1,Red Maple,Acer rubrum,http://x/img.png,Low\n2,Cattail,Typha latifolia\n",
    );

    let output = run_pg(["--store-dir", path_str(&store_dir), "ingest", "--csv", path_str(&csv)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("data row 2"), "stderr:\n{stderr}");

    let count = run_json([
        "--store-dir",
        path_str(&store_dir),
        "collections",
        "count",
        "--name",
        "Plant_Guide",
    ]);
    assert_eq!(as_u64(&count, "count"), 0);
}

#[test]
fn store_dir_and_csv_can_come_from_environment() {
    let dir = unique_temp_dir("pg-env");
    let store_dir = dir.join("from_env");
    let csv = dir.join("plants.csv");
    write_file(&csv, PLANTS_CSV);

    let output = Command::new(env!("CARGO_BIN_EXE_pg"))
        .arg("ingest")
        .env("PLANT_GUIDE_STORE_DIR", &store_dir)
        .env("PLANT_GUIDE_CSV", &csv)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pg binary: {err}"));
    let out = parse_success(&output);
    assert_eq!(as_u64(&out["report"], "inserted"), 2);
    assert!(store_dir.join("plant_guide.sqlite3").exists());
}

#[test]
fn db_commands_report_schema_and_integrity() {
    let dir = unique_temp_dir("pg-db");
    let store_dir = dir.join("chroma_db");

    let before = run_json(["--store-dir", path_str(&store_dir), "db", "schema-version"]);
    assert_eq!(as_u64(&before, "current_version"), 0);
    assert_eq!(before["up_to_date"], Value::Bool(false));

    let dry = run_json(["--store-dir", path_str(&store_dir), "db", "migrate", "--dry-run"]);
    assert_eq!(dry["would_apply_versions"], serde_json::json!([1]));

    let migrated = run_json(["--store-dir", path_str(&store_dir), "db", "migrate"]);
    assert_eq!(as_u64(&migrated, "after_version"), 1);
    assert_eq!(migrated["up_to_date"], Value::Bool(true));

    let integrity = run_json(["--store-dir", path_str(&store_dir), "db", "integrity-check"]);
    assert_eq!(integrity["quick_check_ok"], Value::Bool(true));
}

#[test]
fn delete_unknown_collection_fails() {
    let dir = unique_temp_dir("pg-delete");
    let store_dir = dir.join("chroma_db");

    let output = run_pg([
        "--store-dir",
        path_str(&store_dir),
        "collections",
        "delete",
        "--name",
        "Nope",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("collection does not exist: Nope"), "stderr:\n{stderr}");
}

#[test]
fn ingest_into_reports_collection_leaves_guide_empty() {
    let dir = unique_temp_dir("pg-target");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("plants.csv");
    write_file(&csv, PLANTS_CSV);

    let out = run_json([
        "--store-dir",
        path_str(&store_dir),
        "ingest",
        "--csv",
        path_str(&csv),
        "--collection",
        "Reported_Plants",
    ]);
    assert_eq!(as_str(&out["report"], "collection"), "Reported_Plants");
    assert_eq!(as_u64(&out["report"], "inserted"), 2);

    let listed = run_json(["--store-dir", path_str(&store_dir), "collections", "list"]);
    let summary = as_array(&listed, "collections")
        .iter()
        .map(|c| (as_str(c, "name").to_string(), as_u64(c, "documents")))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![("Plant_Guide".to_string(), 0), ("Reported_Plants".to_string(), 2)]
    );
}

#[test]
fn reports_add_list_and_verify() {
    let dir = unique_temp_dir("pg-reports");
    let store_dir = dir.join("chroma_db");

    let added = run_json([
        "--store-dir",
        path_str(&store_dir),
        "reports",
        "add",
        "--name",
        "Air Potato",
        "--lat",
        "29.65",
        "--lng",
        "-82.32",
        "--notes",
        "climbing the fence",
        "--observed-at",
        "2024-03-01T15:30:00Z",
    ]);
    assert_eq!(as_str(&added, "collection"), "Reported_Plants");
    let report = &added["report"];
    let first_id = as_str(report, "id").to_string();
    assert!(first_id.starts_with("air_potato_"), "id: {first_id}");
    assert_eq!(as_str(report, "status"), "pending");
    assert_eq!(as_str(report, "observed_at"), "2024-03-01T15:30:00Z");

    let second = run_json([
        "--store-dir",
        path_str(&store_dir),
        "reports",
        "add",
        "--name",
        "Cogongrass",
        "--lat",
        "29.7",
        "--lng",
        "-82.4",
    ]);
    let second_id = as_str(&second["report"], "id").to_string();

    let listed = run_json(["--store-dir", path_str(&store_dir), "reports", "list"]);
    let ids = as_array(&listed, "reports").iter().map(|r| as_str(r, "id")).collect::<Vec<_>>();
    assert_eq!(ids, vec![second_id.as_str(), first_id.as_str()]);

    let verified = run_json([
        "--store-dir",
        path_str(&store_dir),
        "reports",
        "verify",
        "--id",
        &first_id,
    ]);
    assert_eq!(as_str(&verified, "status"), "verified");

    let only_verified = run_json([
        "--store-dir",
        path_str(&store_dir),
        "reports",
        "list",
        "--status",
        "verified",
    ]);
    let reports = as_array(&only_verified, "reports");
    assert_eq!(reports.len(), 1);
    assert_eq!(as_str(&reports[0], "id"), first_id);
    assert_eq!(as_str(&reports[0], "notes"), "climbing the fence");

    let limited = run_json([
        "--store-dir",
        path_str(&store_dir),
        "reports",
        "list",
        "--limit",
        "1",
    ]);
    assert_eq!(as_array(&limited, "reports").len(), 1);

    let count = run_json([
        "--store-dir",
        path_str(&store_dir),
        "collections",
        "count",
        "--name",
        "Plant_Guide",
    ]);
    assert_eq!(as_u64(&count, "count"), 0);
}

#[test]
fn reports_add_rejects_out_of_range_latitude() {
    let dir = unique_temp_dir("pg-reports-lat");
    let store_dir = dir.join("chroma_db");

    let output = run_pg([
        "--store-dir",
        path_str(&store_dir),
        "reports",
        "add",
        "--name",
        "Air Potato",
        "--lat",
        "123.0",
        "--lng",
        "-82.3",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("lat MUST be within"), "stderr:\n{stderr}");

    let output = run_pg(["--store-dir", path_str(&store_dir), "reports", "verify", "--id", "nope"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("report does not exist: nope"), "stderr:\n{stderr}");
}

#[test]
fn ingest_logs_run_id_when_info_logging_is_enabled() {
    let dir = unique_temp_dir("pg-logging");
    let store_dir = dir.join("chroma_db");
    let csv = dir.join("plants.csv");
    write_file(&csv, PLANTS_CSV);

    let output = Command::new(env!("CARGO_BIN_EXE_pg"))
        .args(["--store-dir", path_str(&store_dir), "ingest", "--csv", path_str(&csv)])
        .env_remove("PLANT_GUIDE_STORE_DIR")
        .env_remove("PLANT_GUIDE_CSV")
        .env("RUST_LOG", "info")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pg binary: {err}"));
    let out = parse_success(&output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ingest run recorded"), "stderr:\n{stderr}");
    assert!(stderr.contains(as_str(&out, "run_id")), "stderr:\n{stderr}");
}
