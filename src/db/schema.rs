pub const SCHEMA: &str = r#"
-- Folders known to the library. scan_date NULL means the folder needs indexing.
CREATE TABLE IF NOT EXISTS folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    parent_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
    scan_date TEXT
);

CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id);
CREATE INDEX IF NOT EXISTS idx_folders_scan_date ON folders(scan_date);

-- Image files. Filenames are unique per folder, ignoring case.
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
    filename TEXT NOT NULL COLLATE NOCASE,
    file_size INTEGER NOT NULL DEFAULT 0,
    file_created TEXT NOT NULL,
    file_modified TEXT NOT NULL,
    sort_date TEXT NOT NULL,
    last_indexed TEXT NOT NULL,

    -- NULL means the image needs work from the matching job source
    metadata_updated TEXT,
    thumb_generated TEXT,

    sha256_hash TEXT,
    perceptual_hash TEXT,

    UNIQUE(folder_id, filename)
);

CREATE INDEX IF NOT EXISTS idx_images_folder ON images(folder_id);
CREATE INDEX IF NOT EXISTS idx_images_metadata_updated ON images(metadata_updated);
CREATE INDEX IF NOT EXISTS idx_images_thumb_generated ON images(thumb_generated);

-- Extracted metadata, one row per image
CREATE TABLE IF NOT EXISTS image_metadata (
    image_id INTEGER PRIMARY KEY REFERENCES images(id) ON DELETE CASCADE,
    width INTEGER,
    height INTEGER,
    camera_make TEXT,
    camera_model TEXT,
    lens TEXT,
    taken_at TEXT,
    description TEXT,
    copyright TEXT
);

-- Append-only log of requested metadata writes
CREATE TABLE IF NOT EXISTS exif_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    exif_type TEXT NOT NULL,
    operation TEXT NOT NULL,
    text TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'Pending',
    user_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_exif_operations_state ON exif_operations(state, timestamp);
CREATE INDEX IF NOT EXISTS idx_exif_operations_image ON exif_operations(image_id);
"#;
