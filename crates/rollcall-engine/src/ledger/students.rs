//! Student and reference-embedding tables.
//!
//! Students are appended to (new embeddings) or retired, never edited.

use super::{from_millis, to_millis, Ledger, LedgerError};
use crate::gallery::Enrollment;
use crate::types::{Student, StudentId};
use chrono::{DateTime, Utc};
use rollcall_vision::Embedding;
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

const STUDENT_QUERY: &str = "SELECT s.id, s.name, s.registered_at, s.retired,
        (SELECT COUNT(*) FROM embeddings e WHERE e.student_id = s.id)
     FROM students s";

type StudentRow = (i64, String, i64, bool, i64);

fn student_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn student_from_row((id, name, registered_at, retired, embeddings): StudentRow) -> Result<Student, LedgerError> {
    Ok(Student {
        id: StudentId(id),
        name,
        registered_at: from_millis(registered_at)?,
        retired,
        embeddings: usize::try_from(embeddings).unwrap_or(0),
    })
}

pub(crate) fn fetch_student(conn: &Connection, id: StudentId) -> Result<Option<Student>, LedgerError> {
    let row = conn
        .query_row(&format!("{STUDENT_QUERY} WHERE s.id = ?1"), params![id.0], student_row)
        .optional()?;
    row.map(student_from_row).transpose()
}

pub(crate) fn all_students(conn: &Connection) -> Result<Vec<Student>, LedgerError> {
    let mut stmt = conn.prepare(&format!("{STUDENT_QUERY} ORDER BY s.id"))?;
    let rows = stmt.query_map([], student_row)?.collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(student_from_row).collect()
}

impl Ledger {
    /// Register a student. Ids are assigned sequentially starting at 1.
    pub fn register_student(&self, name: &str, at: DateTime<Utc>) -> Result<Student, LedgerError> {
        let id = self.write(|tx| {
            tx.execute(
                "INSERT INTO students (name, registered_at, retired) VALUES (?1, ?2, 0)",
                params![name, to_millis(at)],
            )?;
            Ok(StudentId(tx.last_insert_rowid()))
        })?;
        tracing::info!(student = %id, name, "student registered");
        Ok(Student {
            id,
            name: name.to_string(),
            registered_at: at,
            retired: false,
            embeddings: 0,
        })
    }

    /// Store a reference embedding. Returns `false` if the student already
    /// has this exact vector for this model.
    pub fn append_embedding(&self, student: StudentId, embedding: &Embedding) -> Result<bool, LedgerError> {
        let blob = encode_vector(&embedding.values);
        self.write(|tx| {
            let current = fetch_student(tx, student)?.ok_or(LedgerError::UnknownStudent(student))?;
            if current.retired {
                return Err(LedgerError::StudentRetired(student));
            }
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM embeddings WHERE student_id = ?1 AND model_version = ?2 AND vector = ?3",
                    params![student.0, embedding.model_version, blob],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO embeddings (student_id, vector, model_version, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![student.0, blob, embedding.model_version, to_millis(Utc::now())],
            )?;
            Ok(true)
        })
    }

    /// Retire a student; their embeddings stay on file but leave the gallery.
    pub fn retire_student(&self, student: StudentId) -> Result<(), LedgerError> {
        let changed = self.write(|tx| Ok(tx.execute("UPDATE students SET retired = 1 WHERE id = ?1", params![student.0])?))?;
        if changed == 0 {
            return Err(LedgerError::UnknownStudent(student));
        }
        tracing::info!(%student, "student retired");
        Ok(())
    }

    pub fn student(&self, id: StudentId) -> Result<Option<Student>, LedgerError> {
        self.read(|tx| fetch_student(tx, id))
    }

    pub fn students(&self) -> Result<Vec<Student>, LedgerError> {
        self.read(|tx| all_students(tx))
    }

    /// Reference embeddings of all active students, in enrollment order.
    pub fn enrollments(&self) -> Result<Vec<Enrollment>, LedgerError> {
        self.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT e.student_id, e.vector, e.model_version
                 FROM embeddings e JOIN students s ON s.id = e.student_id
                 WHERE s.retired = 0
                 ORDER BY e.id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, String>(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(student, blob, model_version)| {
                    let values = decode_vector(&blob).ok_or_else(|| {
                        LedgerError::CorruptRow(format!("student {student}: embedding blob of {} bytes", blob.len()))
                    })?;
                    Ok(Enrollment {
                        student_id: StudentId(student),
                        embedding: Embedding::new(values, model_version),
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerOptions;

    fn ledger() -> Ledger {
        Ledger::open_in_memory(LedgerOptions::default()).unwrap()
    }

    #[test]
    fn test_ids_are_sequential() {
        let ledger = ledger();
        let a = ledger.register_student("Ada", Utc::now()).unwrap();
        let b = ledger.register_student("Ben", Utc::now()).unwrap();
        assert_eq!((a.id, b.id), (StudentId(1), StudentId(2)));
        let names: Vec<_> = ledger.students().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Ada", "Ben"]);
    }

    #[test]
    fn test_append_embedding_dedupes() {
        let ledger = ledger();
        let a = ledger.register_student("Ada", Utc::now()).unwrap();
        let e = Embedding::new(vec![0.25, -1.5, 3.0], "m1");
        assert!(ledger.append_embedding(a.id, &e).unwrap());
        assert!(!ledger.append_embedding(a.id, &e).unwrap());
        assert!(ledger.append_embedding(a.id, &Embedding::new(vec![0.25, -1.5, 3.0], "m2")).unwrap());
        assert_eq!(ledger.student(a.id).unwrap().unwrap().embeddings, 2);

        let enrollments = ledger.enrollments().unwrap();
        assert_eq!(enrollments.len(), 2);
        assert_eq!(enrollments[0].embedding, e);
    }

    #[test]
    fn test_retired_students_leave_enrollments() {
        let ledger = ledger();
        let a = ledger.register_student("Ada", Utc::now()).unwrap();
        let b = ledger.register_student("Ben", Utc::now()).unwrap();
        ledger.append_embedding(a.id, &Embedding::new(vec![1.0], "m1")).unwrap();
        ledger.append_embedding(b.id, &Embedding::new(vec![2.0], "m1")).unwrap();
        ledger.retire_student(a.id).unwrap();

        let ids: Vec<_> = ledger.enrollments().unwrap().into_iter().map(|e| e.student_id).collect();
        assert_eq!(ids, vec![b.id]);
        assert!(matches!(
            ledger.append_embedding(a.id, &Embedding::new(vec![3.0], "m1")),
            Err(LedgerError::StudentRetired(_))
        ));
        assert!(matches!(ledger.retire_student(StudentId(42)), Err(LedgerError::UnknownStudent(_))));
    }

    #[test]
    fn test_corrupt_blob_reported() {
        let ledger = ledger();
        let a = ledger.register_student("Ada", Utc::now()).unwrap();
        ledger
            .write(|tx| {
                tx.execute(
                    "INSERT INTO embeddings (student_id, vector, model_version, created_at) VALUES (?1, ?2, 'm1', 0)",
                    params![a.id.0, vec![1u8, 2, 3]],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(ledger.enrollments(), Err(LedgerError::CorruptRow(_))));
    }

    #[test]
    fn test_vector_codec() {
        let values = vec![1.0f32, -0.0, f32::MIN_POSITIVE];
        assert_eq!(decode_vector(&encode_vector(&values)).unwrap(), values);
        assert!(decode_vector(&[0, 1, 2]).is_none());
        assert!(decode_vector(&[]).is_none());
    }
}
