use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const AUTH_STATE_KEY: &str = "antigravity.authState";

// Accounts imported from an existing editor install keep their credentials in
// the editor's globalStorage SQLite database instead of carrying a refresh
// token of their own.
pub fn default_db_path() -> Result<PathBuf, String> {
    #[cfg(target_os = "macos")]
    {
        let home = dirs::home_dir().ok_or("Failed to get home directory")?;
        Ok(home.join("Library/Application Support/Antigravity/User/globalStorage/state.vscdb"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA")
            .map_err(|_| "Failed to get APPDATA environment variable".to_string())?;
        Ok(PathBuf::from(appdata).join("Antigravity\\User\\globalStorage\\state.vscdb"))
    }

    #[cfg(target_os = "linux")]
    {
        let home = dirs::home_dir().ok_or("Failed to get home directory")?;
        Ok(home.join(".config/Antigravity/User/globalStorage/state.vscdb"))
    }
}

pub fn read_access_token(path: Option<&Path>) -> Result<String, String> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_db_path()?,
    };
    if !path.exists() {
        return Err(format!("Legacy auth database not found: {:?}", path));
    }

    let conn = Connection::open(&path).map_err(|e| format!("Failed to open database: {}", e))?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM ItemTable WHERE key = ?1",
            [AUTH_STATE_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("Failed to query auth state: {}", e))?;

    let raw = raw.ok_or_else(|| format!("No auth state stored under {}", AUTH_STATE_KEY))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| format!("Auth state is not valid JSON: {}", e))?;

    value
        .get("accessToken")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| "Auth state has no accessToken".to_string())
}
