// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Write operations.
//!
//! All multi-row writes go through a single `BEGIN IMMEDIATE` transaction
//! so a batch either registers completely or not at all, with every
//! reference either already valid or satisfied within the batch.

use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;

use rusqlite::{TransactionBehavior, params};

use crate::connection::StoreDb;
use crate::error::{Error, Result};
use crate::types::system_time_to_unix;

/// Everything needed to register one valid path.
#[derive(Debug, Clone)]
pub struct RegisterPathParams {
    pub path: String,
    /// NAR hash in `sha256:<base16>` form.
    pub hash: String,
    pub registration_time: SystemTime,
    pub deriver: Option<String>,
    pub nar_size: Option<u64>,
    pub ultimate: bool,
    /// Space-separated signatures.
    pub sigs: Option<String>,
    pub ca: Option<String>,
    pub references: BTreeSet<String>,
}

impl Default for RegisterPathParams {
    fn default() -> Self {
        Self {
            path: String::new(),
            hash: String::new(),
            registration_time: SystemTime::now(),
            deriver: None,
            nar_size: None,
            ultimate: false,
            sigs: None,
            ca: None,
            references: BTreeSet::new(),
        }
    }
}

impl StoreDb {
    /// Register a single path. Shorthand for a one-element batch.
    pub fn register_valid_path(&mut self, params: &RegisterPathParams) -> Result<i64> {
        let ids = self.register_valid_paths(std::slice::from_ref(params))?;
        Ok(ids[0])
    }

    /// Atomically register a batch of paths.
    ///
    /// The whole batch is validated first: every reference must be either
    /// already valid or the path of another batch member. On any failure
    /// the transaction rolls back and the database is unchanged.
    ///
    /// A path already valid is updated in place (repair/re-registration),
    /// keeping its id.
    pub fn register_valid_paths(&mut self, batch: &[RegisterPathParams]) -> Result<Vec<i64>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let batch_paths: BTreeSet<&str> = batch.iter().map(|p| p.path.as_str()).collect();

        // Validate the reference closure before touching any row.
        for item in batch {
            for reference in &item.references {
                if batch_paths.contains(reference.as_str()) {
                    continue;
                }
                let valid: bool = tx
                    .query_row(
                        "SELECT 1 FROM ValidPaths WHERE path = ?1 LIMIT 1",
                        params![reference],
                        |_| Ok(()),
                    )
                    .is_ok();
                if !valid {
                    return Err(Error::RefNotValid {
                        referrer: item.path.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        // Insert (or update) all rows, collecting ids for the edges.
        let mut ids: HashMap<&str, i64> = HashMap::with_capacity(batch.len());
        for item in batch {
            tx.execute(
                r#"
                INSERT INTO ValidPaths (path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(path) DO UPDATE SET
                    hash = excluded.hash,
                    registrationTime = excluded.registrationTime,
                    deriver = excluded.deriver,
                    narSize = excluded.narSize,
                    ultimate = excluded.ultimate,
                    sigs = excluded.sigs,
                    ca = excluded.ca
                "#,
                params![
                    item.path,
                    item.hash,
                    system_time_to_unix(item.registration_time),
                    item.deriver,
                    item.nar_size.map(|n| n as i64),
                    i32::from(item.ultimate),
                    item.sigs,
                    item.ca,
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM ValidPaths WHERE path = ?1",
                params![item.path],
                |row| row.get(0),
            )?;
            ids.insert(item.path.as_str(), id);
        }

        for item in batch {
            let referrer = ids[item.path.as_str()];
            tx.execute("DELETE FROM Refs WHERE referrer = ?1", params![referrer])?;
            for reference in &item.references {
                let ref_id = match ids.get(reference.as_str()) {
                    Some(id) => *id,
                    None => tx.query_row(
                        "SELECT id FROM ValidPaths WHERE path = ?1",
                        params![reference],
                        |row| row.get(0),
                    )?,
                };
                tx.execute(
                    "INSERT OR REPLACE INTO Refs (referrer, reference) VALUES (?1, ?2)",
                    params![referrer, ref_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(batch.iter().map(|item| ids[item.path.as_str()]).collect())
    }

    /// Remove a path. Fails while other valid paths still reference it
    /// (the foreign key is `on delete restrict`).
    pub fn invalidate_path(&self, path: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM ValidPaths WHERE path = ?1", params![path])?;
        Ok(rows > 0)
    }

    /// Replace the signature set of a path.
    pub fn update_signatures(&self, path: &str, sigs: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE ValidPaths SET sigs = ?2 WHERE path = ?1",
            params![path, sigs],
        )?;
        if rows == 0 {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        Ok(())
    }

    /// Record one output of a valid derivation.
    pub fn register_derivation_output(
        &self,
        drv_path: &str,
        output_name: &str,
        output_path: &str,
    ) -> Result<()> {
        let rows = self.conn.execute(
            r#"
            INSERT OR REPLACE INTO DerivationOutputs (drv, id, path)
            SELECT v.id, ?2, ?3 FROM ValidPaths v WHERE v.path = ?1
            "#,
            params![drv_path, output_name, output_path],
        )?;
        if rows == 0 {
            return Err(Error::InvalidPath(drv_path.to_owned()));
        }
        Ok(())
    }

    /// Record a realisation binding; the output path must be valid.
    pub fn register_realisation(
        &self,
        drv_hash: &str,
        output_name: &str,
        output_path: &str,
        signatures: Option<&str>,
    ) -> Result<i64> {
        let path_id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM ValidPaths WHERE path = ?1",
                params![output_path],
                |row| row.get(0),
            )
            .map_err(|_| Error::InvalidPath(output_path.to_owned()))?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO Realisations (drvHash, outputName, outputPath, signatures)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![drv_hash, output_name, path_id, signatures],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_for(path: &str, refs: &[&str]) -> RegisterPathParams {
        RegisterPathParams {
            path: path.to_owned(),
            hash: "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
                .to_owned(),
            nar_size: Some(120),
            references: refs.iter().map(|s| (*s).to_owned()).collect(),
            ..Default::default()
        }
    }

    const P1: &str = "/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-one";
    const P2: &str = "/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-two";
    const P3: &str = "/nix/store/cccccccccccccccccccccccccccccccc-three";

    #[test]
    fn register_and_query() {
        let mut db = StoreDb::open_memory().unwrap();
        db.register_valid_path(&params_for(P1, &[])).unwrap();

        let info = db.query_path_info(P1).unwrap().unwrap();
        assert_eq!(info.path, P1);
        assert_eq!(info.nar_size, Some(120));
        assert!(db.is_valid_path(P1).unwrap());
        assert!(!db.is_valid_path(P2).unwrap());
    }

    #[test]
    fn batch_with_internal_references_is_atomic() {
        let mut db = StoreDb::open_memory().unwrap();
        // P2 references P1; both arrive in one batch, in "wrong" order.
        let batch = vec![params_for(P2, &[P1]), params_for(P1, &[])];
        db.register_valid_paths(&batch).unwrap();

        assert_eq!(
            db.query_references(P2).unwrap(),
            BTreeSet::from([P1.to_owned()])
        );
        assert_eq!(
            db.query_referrers(P1).unwrap(),
            BTreeSet::from([P2.to_owned()])
        );
    }

    #[test]
    fn batch_with_dangling_reference_is_rejected_entirely() {
        let mut db = StoreDb::open_memory().unwrap();
        let batch = vec![params_for(P1, &[]), params_for(P2, &[P3])];
        let err = db.register_valid_paths(&batch).unwrap_err();
        assert!(matches!(err, Error::RefNotValid { .. }));

        // Nothing was registered, including the well-formed member.
        assert!(!db.is_valid_path(P1).unwrap());
        assert!(!db.is_valid_path(P2).unwrap());
    }

    #[test]
    fn self_reference_allowed() {
        let mut db = StoreDb::open_memory().unwrap();
        db.register_valid_path(&params_for(P1, &[P1])).unwrap();
        assert_eq!(
            db.query_references(P1).unwrap(),
            BTreeSet::from([P1.to_owned()])
        );
    }

    #[test]
    fn reregistration_updates_in_place() {
        let mut db = StoreDb::open_memory().unwrap();
        let id1 = db.register_valid_path(&params_for(P1, &[])).unwrap();

        let mut updated = params_for(P1, &[]);
        updated.nar_size = Some(999);
        updated.ultimate = true;
        let id2 = db.register_valid_path(&updated).unwrap();

        assert_eq!(id1, id2);
        let info = db.query_path_info(P1).unwrap().unwrap();
        assert_eq!(info.nar_size, Some(999));
        assert!(info.ultimate);
    }

    #[test]
    fn invalidate_respects_referrers() {
        let mut db = StoreDb::open_memory().unwrap();
        db.register_valid_paths(&[params_for(P1, &[]), params_for(P2, &[P1])])
            .unwrap();

        // P1 is still referenced by P2: restricted.
        assert!(db.invalidate_path(P1).is_err());
        // Deleting the referrer first works.
        assert!(db.invalidate_path(P2).unwrap());
        assert!(db.invalidate_path(P1).unwrap());
        assert!(!db.is_valid_path(P1).unwrap());
    }

    #[test]
    fn hash_part_lookup() {
        let mut db = StoreDb::open_memory().unwrap();
        db.register_valid_path(&params_for(P1, &[])).unwrap();

        let found = db
            .query_path_from_hash_part("/nix/store", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .unwrap();
        assert_eq!(found.as_deref(), Some(P1));
        let missing = db
            .query_path_from_hash_part("/nix/store", "dddddddddddddddddddddddddddddddd")
            .unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn derivation_outputs_roundtrip() {
        let mut db = StoreDb::open_memory().unwrap();
        let drv = "/nix/store/dddddddddddddddddddddddddddddddd-x.drv";
        db.register_valid_path(&params_for(drv, &[])).unwrap();
        db.register_derivation_output(drv, "out", P1).unwrap();

        let outputs = db.query_derivation_outputs(drv).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].output_name, "out");
        assert_eq!(outputs[0].path, P1);

        db.register_valid_path(&params_for(P1, &[])).unwrap();
        assert_eq!(db.query_valid_derivers(P1).unwrap(), vec![drv.to_owned()]);
    }

    #[test]
    fn realisation_roundtrip() {
        let mut db = StoreDb::open_memory().unwrap();
        db.register_valid_path(&params_for(P1, &[])).unwrap();

        let drv_hash = "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s";
        db.register_realisation(drv_hash, "out", P1, Some("k:abc"))
            .unwrap();

        let found = db.query_realisation(drv_hash, "out").unwrap().unwrap();
        assert_eq!(found.output_name, "out");
        assert_eq!(db.path_by_id(found.output_path_id).unwrap().as_deref(), Some(P1));
        assert!(db.query_realisation(drv_hash, "dev").unwrap().is_none());
    }

    #[test]
    fn update_signatures_requires_valid_path() {
        let db_err = {
            let db = StoreDb::open_memory().unwrap();
            db.update_signatures(P1, "k:abc").unwrap_err()
        };
        assert!(matches!(db_err, Error::InvalidPath(_)));
    }
}
