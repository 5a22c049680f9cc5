// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Read queries.

use std::collections::BTreeSet;

use rusqlite::params;

use crate::connection::StoreDb;
use crate::error::Result;
use crate::types::{DerivationOutputRow, PathInfoRow, RealisationRow, unix_to_system_time};

impl StoreDb {
    /// Path info by absolute path string, `None` when not valid.
    pub fn query_path_info(&self, path: &str) -> Result<Option<PathInfoRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT id, path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca
            FROM ValidPaths
            WHERE path = ?1
            "#,
        )?;

        let row = stmt.query_row(params![path], |row| {
            Ok(PathInfoRow {
                id: row.get(0)?,
                path: row.get(1)?,
                hash: row.get(2)?,
                registration_time: unix_to_system_time(row.get(3)?),
                deriver: row.get(4)?,
                nar_size: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
                ultimate: row.get::<_, Option<i32>>(6)?.unwrap_or(0) != 0,
                sigs: row.get(7)?,
                ca: row.get(8)?,
                references: BTreeSet::new(),
            })
        });

        match row {
            Ok(mut info) => {
                info.references = self.references_by_id(info.id)?;
                Ok(Some(info))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_valid_path(&self, path: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM ValidPaths WHERE path = ?1 LIMIT 1")?;
        Ok(stmt.query_row(params![path], |_| Ok(())).is_ok())
    }

    /// Find a valid path whose base name starts with `hash_part`.
    pub fn query_path_from_hash_part(
        &self,
        store_dir: &str,
        hash_part: &str,
    ) -> Result<Option<String>> {
        let prefix = format!("{store_dir}/{hash_part}");
        let mut stmt = self
            .conn
            .prepare_cached("SELECT path FROM ValidPaths WHERE path >= ?1 LIMIT 1")?;
        let candidate: Option<String> = stmt.query_row(params![&prefix], |row| row.get(0)).ok();
        Ok(candidate.filter(|path| path.starts_with(&prefix)))
    }

    pub fn query_references(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r JOIN ValidPaths v ON r.reference = v.id
            WHERE r.referrer = (SELECT id FROM ValidPaths WHERE path = ?1)
            "#,
        )?;
        collect_strings(stmt.query(params![path])?)
    }

    pub(crate) fn references_by_id(&self, id: i64) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r JOIN ValidPaths v ON r.reference = v.id
            WHERE r.referrer = ?1
            "#,
        )?;
        collect_strings(stmt.query(params![id])?)
    }

    /// Reverse edges: everything that references `path`.
    pub fn query_referrers(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r JOIN ValidPaths v ON r.referrer = v.id
            WHERE r.reference = (SELECT id FROM ValidPaths WHERE path = ?1)
            "#,
        )?;
        collect_strings(stmt.query(params![path])?)
    }

    /// Valid derivations that declare `output_path` as an output.
    pub fn query_valid_derivers(&self, output_path: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM DerivationOutputs d JOIN ValidPaths v ON d.drv = v.id
            WHERE d.path = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![output_path])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn query_derivation_outputs(&self, drv_path: &str) -> Result<Vec<DerivationOutputRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT d.drv, d.id, d.path
            FROM DerivationOutputs d JOIN ValidPaths v ON d.drv = v.id
            WHERE v.path = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![drv_path])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DerivationOutputRow {
                drv_id: row.get(0)?,
                output_name: row.get(1)?,
                path: row.get(2)?,
            });
        }
        Ok(out)
    }

    /// Every valid path. Slow on big stores; used by verify and GC.
    pub fn query_all_valid_paths(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached("SELECT path FROM ValidPaths")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn count_valid_paths(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ValidPaths", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn query_realisation(
        &self,
        drv_hash: &str,
        output_name: &str,
    ) -> Result<Option<RealisationRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT id, drvHash, outputName, outputPath, signatures
            FROM Realisations
            WHERE drvHash = ?1 AND outputName = ?2
            "#,
        )?;
        let row = stmt.query_row(params![drv_hash, output_name], |row| {
            Ok(RealisationRow {
                id: row.get(0)?,
                drv_hash: row.get(1)?,
                output_name: row.get(2)?,
                output_path_id: row.get(3)?,
                signatures: row.get(4)?,
            })
        });
        match row {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a realisation's output path id back to the path string.
    pub fn path_by_id(&self, id: i64) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT path FROM ValidPaths WHERE id = ?1")?;
        match stmt.query_row(params![id], |row| row.get(0)) {
            Ok(path) => Ok(Some(path)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn collect_strings(mut rows: rusqlite::Rows<'_>) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    while let Some(row) = rows.next()? {
        out.insert(row.get(0)?);
    }
    Ok(out)
}
