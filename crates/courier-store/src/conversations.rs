use std::collections::BTreeSet;

use rusqlite::params;

use courier_shared::PublicKey;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Counterparties recorded for `owner`.
    pub fn get_conversations(&self, owner: &PublicKey) -> Result<BTreeSet<PublicKey>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT counterparty FROM conversations WHERE owner = ?1")?;
        let rows = stmt.query_map(params![owner.to_hex()], |row| row.get::<_, String>(0))?;

        let mut set = BTreeSet::new();
        for row in rows {
            let hex = row?;
            let pubkey = PublicKey::from_hex(&hex)
                .map_err(|e| StoreError::Corrupt(format!("counterparty {hex}: {e}")))?;
            set.insert(pubkey);
        }
        Ok(set)
    }

    /// Merge `counterparties` into the stored set. Nothing is removed.
    pub fn add_conversations(
        &mut self,
        owner: &PublicKey,
        counterparties: &BTreeSet<PublicKey>,
    ) -> Result<()> {
        let owner = owner.to_hex();
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO conversations (owner, counterparty) VALUES (?1, ?2)",
            )?;
            for counterparty in counterparties {
                stmt.execute(params![owner, counterparty.to_hex()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_all_conversations(&self) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM conversations", [])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{Identity, Signer};

    #[test]
    fn conversations_merge_per_owner() {
        let mut db = Database::open_in_memory().unwrap();
        let me = Identity::generate().public_key();
        let other_owner = Identity::generate().public_key();
        let bob = Identity::generate().public_key();
        let carol = Identity::generate().public_key();

        assert!(db.get_conversations(&me).unwrap().is_empty());

        db.add_conversations(&me, &BTreeSet::from([bob])).unwrap();
        db.add_conversations(&me, &BTreeSet::from([bob, carol])).unwrap();
        db.add_conversations(&other_owner, &BTreeSet::from([carol])).unwrap();

        assert_eq!(db.get_conversations(&me).unwrap(), BTreeSet::from([bob, carol]));
        assert_eq!(
            db.get_conversations(&other_owner).unwrap(),
            BTreeSet::from([carol])
        );

        assert_eq!(db.delete_all_conversations().unwrap(), 3);
        assert!(db.get_conversations(&me).unwrap().is_empty());
    }
}
