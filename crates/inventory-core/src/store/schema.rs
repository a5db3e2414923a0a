//! Relational schema for the inventory store.
//!
//! Every statement is `IF NOT EXISTS`, and column migrations tolerate
//! "duplicate column", so `apply` can run on every start.

use rusqlite::Connection;
use tracing::{debug, info};

/// Tables a usable archive must carry.
pub const CORE_TABLES: [&str; 4] = ["proyectos", "reportes", "inventarios", "logs_auditoria"];

pub const ALL_TABLES: [&str; 7] = [
    "proyectos",
    "reportes",
    "inventarios",
    "logs_auditoria",
    "configuracion",
    "logs_acceso",
    "empresa",
];

const BASE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS proyectos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        nombre TEXT NOT NULL UNIQUE,
        descripcion TEXT,
        cliente TEXT,
        activo INTEGER NOT NULL DEFAULT 1,
        fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_proyectos_activo ON proyectos(activo);

    CREATE TABLE IF NOT EXISTS reportes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        proyecto_id INTEGER NOT NULL,
        titulo TEXT NOT NULL,
        contenido TEXT,
        firma_ruta TEXT,
        fecha TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (proyecto_id) REFERENCES proyectos(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_reportes_proyecto ON reportes(proyecto_id);
    CREATE INDEX IF NOT EXISTS idx_reportes_fecha ON reportes(fecha);

    CREATE TABLE IF NOT EXISTS inventarios (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        proyecto_id INTEGER NOT NULL,
        codigo TEXT NOT NULL,
        descripcion TEXT,
        categoria TEXT,
        cantidad INTEGER NOT NULL DEFAULT 0,
        ubicacion TEXT,
        activo INTEGER NOT NULL DEFAULT 1,
        fecha TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (proyecto_id) REFERENCES proyectos(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_inventarios_proyecto ON inventarios(proyecto_id);
    CREATE INDEX IF NOT EXISTS idx_inventarios_categoria ON inventarios(categoria);
    CREATE INDEX IF NOT EXISTS idx_inventarios_activo ON inventarios(activo);

    CREATE TABLE IF NOT EXISTS logs_auditoria (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        usuario TEXT NOT NULL,
        accion TEXT NOT NULL,
        detalle TEXT,
        fecha TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_logs_auditoria_fecha ON logs_auditoria(fecha);
    CREATE INDEX IF NOT EXISTS idx_logs_auditoria_usuario ON logs_auditoria(usuario);

    CREATE TABLE IF NOT EXISTS configuracion (
        clave TEXT PRIMARY KEY,
        valor TEXT,
        actualizado TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS logs_acceso (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        usuario TEXT NOT NULL,
        exitoso INTEGER NOT NULL,
        origen TEXT,
        fecha TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_logs_acceso_usuario ON logs_acceso(usuario);
    CREATE INDEX IF NOT EXISTS idx_logs_acceso_fecha ON logs_acceso(fecha);

    CREATE TABLE IF NOT EXISTS empresa (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        nombre TEXT NOT NULL,
        nit TEXT,
        direccion TEXT,
        telefono TEXT,
        logo_ruta TEXT
    );
"#;

/// Columns added after the first release. (table, column, definition)
const COLUMN_MIGRATIONS: &[(&str, &str, &str)] = &[
    ("proyectos", "ubicacion", "TEXT"),
    ("reportes", "estado", "TEXT NOT NULL DEFAULT 'borrador'"),
    ("inventarios", "valor_unitario", "REAL NOT NULL DEFAULT 0"),
    ("empresa", "correo", "TEXT"),
];

/// Create or verify every table, index and migrated column.
pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(BASE_SCHEMA)?;
    for (table, column, definition) in COLUMN_MIGRATIONS {
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {definition}");
        match conn.execute(&sql, []) {
            Ok(_) => info!(table, column, "column added"),
            Err(e) if is_duplicate_column(&e) => debug!(table, column, "column already present"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    err.to_string().to_ascii_lowercase().contains("duplicate column")
}

/// How many of `tables` exist in the connected database.
pub fn count_present(conn: &Connection, tables: &[&str]) -> rusqlite::Result<usize> {
    let mut stmt =
        conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    let mut present = 0;
    for table in tables {
        let n: i64 = stmt.query_row([table], |row| row.get(0))?;
        if n > 0 {
            present += 1;
        }
    }
    Ok(present)
}

/// Row count per core table; missing tables count as zero.
pub fn core_row_counts(conn: &Connection) -> rusqlite::Result<Vec<(String, i64)>> {
    let mut out = Vec::with_capacity(CORE_TABLES.len());
    for table in CORE_TABLES {
        let n = if count_present(conn, &[table])? == 1 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?
        } else {
            0
        };
        out.push((table.to_string(), n));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
        assert_eq!(count_present(&conn, &ALL_TABLES).unwrap(), ALL_TABLES.len());

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, ALL_TABLES.len() as i64);
    }

    #[test]
    fn empresa_is_single_row() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        conn.execute("INSERT INTO empresa (id, nombre) VALUES (1, 'ACME')", [])
            .unwrap();
        assert!(conn
            .execute("INSERT INTO empresa (id, nombre) VALUES (2, 'Other')", [])
            .is_err());
    }

    #[test]
    fn migrated_columns_exist() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        conn.execute(
            "INSERT INTO proyectos (nombre, ubicacion) VALUES ('P1', 'Bodega 2')",
            [],
        )
        .unwrap();
        let estado: String = {
            conn.execute(
                "INSERT INTO reportes (proyecto_id, titulo) VALUES (1, 'R1')",
                [],
            )
            .unwrap();
            conn.query_row("SELECT estado FROM reportes", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(estado, "borrador");
    }

    #[test]
    fn row_counts_cover_core_tables() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        conn.execute("INSERT INTO proyectos (nombre) VALUES ('P1')", [])
            .unwrap();
        let counts = core_row_counts(&conn).unwrap();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[0], ("proyectos".to_string(), 1));
        assert_eq!(counts[3].1, 0);
    }
}
