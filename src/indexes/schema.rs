use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, INDEXED, STORED, STRING,
};

/// Field layout for a document index: the searchable contents of one file
/// plus the metadata needed to filter and redisplay hits.
#[derive(Clone)]
pub struct DocFields {
    pub schema: Schema,

    /// Path relative to the index base; doubles as the document id
    pub path: Field,
    /// Parent directory of `path`, kept as a single unbroken token so
    /// directory restrictions match exactly
    pub dir: Field,

    pub size: Field,
    pub mod_time: Field,
    /// Lowercase extension including the leading dot
    pub extension: Field,

    /// Full file contents; indexed with positions, never stored
    pub content: Field,
}

impl DocFields {
    pub fn new() -> Self {
        let mut builder = tantivy::schema::SchemaBuilder::new();
        let text = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("default")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );

        let path = builder.add_text_field("path", STRING | STORED);
        let dir = builder.add_text_field("dir", STRING);
        let size = builder.add_i64_field("size", INDEXED | STORED);
        let mod_time = builder.add_date_field("mod_time", INDEXED | STORED);
        let extension = builder.add_text_field("extension", STRING | STORED);
        let content = builder.add_text_field("content", text);

        Self {
            schema: builder.build(),
            path,
            dir,
            size,
            mod_time,
            extension,
            content,
        }
    }
}

impl Default for DocFields {
    fn default() -> Self {
        Self::new()
    }
}
