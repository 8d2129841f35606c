use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Daemon {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Daemon {
    fn start() -> Self {
        let exe = env!("CARGO_BIN_EXE_salamandrad");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn salamandrad");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Daemon {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 1,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id.to_string();
        self.next_id += 1;
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn call_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let resp = self.call(method, params);
        assert_eq!(resp["ok"], true, "{} failed: {}", method, resp);
        resp["result"].clone()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn seed(d: &mut Daemon, ws: &PathBuf, students: usize) {
    d.call_ok("workspace.select", json!({ "path": ws.to_string_lossy() }));
    d.call_ok(
        "schools.create",
        json!({ "id": "sch", "name": "Escola", "currentSchoolYear": 2026, "currentTrimester": 1 }),
    );
    d.call_ok(
        "staff.create",
        json!({ "id": "admin", "schoolId": "sch", "fullName": "Direcao", "role": "school_admin" }),
    );
    d.call_ok(
        "staff.create",
        json!({ "id": "prof", "callerId": "admin", "schoolId": "sch",
                "fullName": "Carlos Nhaca", "role": "teacher" }),
    );
    d.call_ok(
        "sections.create",
        json!({ "id": "sec", "callerId": "admin", "schoolId": "sch",
                "name": "10A", "gradeLabel": "10a", "room": "Sala 4",
                "shift": "manha", "schoolYear": 2026 }),
    );
    d.call_ok(
        "subjects.create",
        json!({ "id": "mat", "callerId": "admin", "schoolId": "sch",
                "name": "Matematica", "sortOrder": 1 }),
    );
    d.call_ok(
        "staff.assignTeaching",
        json!({ "callerId": "admin", "schoolId": "sch", "staffId": "prof",
                "sectionId": "sec", "subjectId": "mat" }),
    );
    d.call_ok(
        "profiles.upsert",
        json!({ "callerId": "prof", "staffId": "prof", "academicLevel": "Licenciatura",
                "trainingArea": "Matematica", "contact": "84 000 0000" }),
    );
    for i in 0..students {
        d.call_ok(
            "students.create",
            json!({ "id": format!("stu{:03}", i), "callerId": "admin", "schoolId": "sch",
                    "sectionId": "sec", "fullName": format!("Aluno {:03}", i),
                    "sex": if i % 2 == 0 { "F" } else { "M" }, "rollNumber": i + 1 }),
        );
    }
}

fn install_template(d: &mut Daemon, bracket: i64) {
    let result = d.call_ok(
        "templates.save",
        json!({ "callerId": "admin", "schoolId": "sch", "docType": "CADERNETA",
                "bracket": bracket, "version": "1",
                "sheet": {
                    "sheetName": "Caderneta",
                    "cells": { "A1": "CADERNETA DA DISCIPLINA" },
                    "merged": ["A1:F1"]
                },
                "mapping": {
                    "headerCells": {
                        "teacherName": "A9", "academicLevel": "E9", "trainingArea": "N9",
                        "contact": "U9", "subject": "A10", "gradeLabel": "E10",
                        "sectionName": "J10", "schoolYear": "W10", "totalStudents": "A11"
                    },
                    "startRow": 15,
                    "maxStudentRows": bracket,
                    "studentColumns": { "rollNumber": "A", "fullName": "B", "sex": "C" },
                    "gradeColumns": { "ACS1": "D", "MT": "H", "COM": "I" },
                    "continuationCell": "F2"
                } }),
    );
    let id = result["templateId"].as_str().expect("template id").to_string();
    d.call_ok("templates.activate", json!({ "callerId": "admin", "templateId": id }));
}

#[test]
fn generation_paginates_and_records_every_part() {
    let ws = temp_dir("salamandra-docs-paginate");
    let mut d = Daemon::start();
    seed(&mut d, &ws, 55);
    install_template(&mut d, 50);

    let result = d.call_ok(
        "documents.generate",
        json!({ "callerId": "prof", "sectionId": "sec", "subjectId": "mat",
                "schoolYear": 2026, "trimester": 1 }),
    );
    let parts = result["document"]["parts"].as_array().expect("parts");
    assert_eq!(parts.len(), 2);
    for part in parts {
        let path = part["filePath"].as_str().expect("path");
        let bytes = std::fs::read(path).expect("artifact on disk");
        assert_eq!(&bytes[..4], &[0x50, 0x4B, 0x03, 0x04], "xlsx container");
        assert_eq!(part["partsTotal"], 2);
    }

    let result = d.call_ok(
        "documents.list",
        json!({ "callerId": "admin", "sectionId": "sec", "subjectId": "mat" }),
    );
    let docs = result["documents"].as_array().expect("docs");
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["templateVersion"], "1");
}

#[test]
fn async_generation_parks_the_result_behind_a_token() {
    let ws = temp_dir("salamandra-docs-async");
    let mut d = Daemon::start();
    seed(&mut d, &ws, 5);
    install_template(&mut d, 50);

    let result = d.call_ok(
        "documents.generateAsync",
        json!({ "callerId": "prof", "sectionId": "sec", "subjectId": "mat",
                "schoolYear": 2026, "trimester": 1 }),
    );
    assert_eq!(result["partsTotal"], 1);
    let token = result["token"].as_str().expect("token").to_string();

    let result = d.call_ok("documents.fetch", json!({ "token": token }));
    let part = &result["document"]["parts"][0];
    let document_id = part["id"].as_str().expect("doc id").to_string();

    let result = d.call_ok(
        "documents.download",
        json!({ "callerId": "admin", "documentId": document_id }),
    );
    let size = result["sizeBytes"].as_u64().expect("size");
    assert!(size > 0);
    assert_eq!(result["sha256"], part["sha256"]);

    let resp = d.call("documents.fetch", json!({ "token": "no-such-token" }));
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "token_expired");
}

#[test]
fn download_refuses_a_tampered_artifact() {
    let ws = temp_dir("salamandra-docs-tamper");
    let mut d = Daemon::start();
    seed(&mut d, &ws, 3);
    install_template(&mut d, 50);

    let result = d.call_ok(
        "documents.generate",
        json!({ "callerId": "prof", "sectionId": "sec", "subjectId": "mat",
                "schoolYear": 2026, "trimester": 1 }),
    );
    let part = &result["document"]["parts"][0];
    let document_id = part["id"].as_str().expect("doc id");
    let path = part["filePath"].as_str().expect("path");

    std::fs::write(path, b"not an xlsx any more").expect("tamper");
    let resp = d.call(
        "documents.download",
        json!({ "callerId": "admin", "documentId": document_id }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "conflict_retry");
}

#[test]
fn generation_requires_a_complete_teacher_profile() {
    let ws = temp_dir("salamandra-docs-profile");
    let mut d = Daemon::start();
    seed(&mut d, &ws, 3);
    install_template(&mut d, 50);
    d.call_ok(
        "profiles.upsert",
        json!({ "callerId": "prof", "staffId": "prof", "academicLevel": "Licenciatura",
                "trainingArea": "Matematica", "contact": "" }),
    );

    let resp = d.call(
        "documents.generate",
        json!({ "callerId": "prof", "sectionId": "sec", "subjectId": "mat",
                "schoolYear": 2026, "trimester": 1 }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "incomplete_teacher_profile");
    assert_eq!(resp["error"]["category"], "configuration");
    assert_eq!(resp["error"]["details"]["missing"][0], "contact");

    // The gate is on the requester: an admin with no profile of their
    // own is refused even though the subject teacher's is complete.
    d.call_ok(
        "profiles.upsert",
        json!({ "callerId": "prof", "staffId": "prof", "academicLevel": "Licenciatura",
                "trainingArea": "Matematica", "contact": "84 000 0000" }),
    );
    let resp = d.call(
        "documents.generate",
        json!({ "callerId": "admin", "sectionId": "sec", "subjectId": "mat",
                "schoolYear": 2026, "trimester": 1 }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "incomplete_teacher_profile");
    assert_eq!(resp["error"]["details"]["staffId"], "admin");
}
