//! [`PieceStore`] over a SPARQL endpoint.
//!
//! Every statement is a [`sparql::statement`] template; piece, file and
//! graph IRIs are bound, never formatted in.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::{PieceStore, Relink};
use crate::graph::{optional_value, value, Binding, GraphStore};
use crate::models::{FilePair, FileRecord, PieceFile, StaleCopy, StaleCopyKind};
use crate::sparql::{self, Expr};

const PREFIXES: &str = "\
PREFIX mu: <http://mu.semte.ch/vocabularies/core/>
PREFIX dct: <http://purl.org/dc/terms/>
PREFIX nfo: <http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#>
PREFIX nie: <http://www.semanticdesktop.org/ontologies/2007/01/19/nie#>
PREFIX dbpedia: <http://dbpedia.org/ontology/>
PREFIX prov: <http://www.w3.org/ns/prov#>
PREFIX dossier: <https://data.vlaanderen.be/ns/dossier#>
PREFIX besluitvorming: <https://data.vlaanderen.be/ns/besluitvorming#>
PREFIX sign: <http://mu.semte.ch/vocabularies/ext/handtekenen/>
";

const IS_MAIN_PIECE: &str = "
ASK {
  GRAPH {{graph}} {
    {{piece}} a dossier:Stuk ;
      prov:value ?file .
  }
  FILTER EXISTS {
    ?container a dossier:Serie ;
      dossier:Collectie.bestaatUit {{piece}} .
  }
  FILTER NOT EXISTS { {{piece}} sign:ongetekendStuk ?unsignedPiece . }
  FILTER NOT EXISTS { ?signedPiece sign:getekendStukKopie {{piece}} . }
}";

const PIECE_FILE: &str = "
SELECT ?file ?source ?id ?name ?format ?size ?extension ?physical ?accessLevel
WHERE {
  GRAPH {{graph}} {
    {{piece}} a dossier:Stuk ;
      prov:value ?source .
    OPTIONAL { {{piece}} besluitvorming:vertrouwelijkheidsniveau ?accessLevel . }
    OPTIONAL { ?derived prov:hadPrimarySource ?source . }
    BIND(COALESCE(?derived, ?source) AS ?file)
    ?file a nfo:FileDataObject ;
      mu:uuid ?id ;
      nfo:fileName ?name ;
      dct:format ?format ;
      nfo:fileSize ?size ;
      dbpedia:fileExtension ?extension .
    ?physical nie:dataSource ?file .
  }
}
LIMIT 1";

const STALE_COPIES: &str = "
SELECT DISTINCT ?copy ?kind ?file ?physical
WHERE {
  GRAPH {{graph}} {
    {
      ?copy sign:ongetekendStuk {{piece}} .
      BIND(\"signed\" AS ?kind)
    } UNION {
      {{piece}} sign:getekendStukKopie ?copy .
      BIND(\"flattened\" AS ?kind)
    }
    OPTIONAL {
      ?copy prov:value ?file .
      FILTER(?file != {{current}})
      OPTIONAL { ?physical nie:dataSource ?file . }
    }
  }
}";

/// Both removals only match while the piece is still bound to the file
/// resolved for the run: `{{source}}` directly, with `{{resolved}}` either
/// that same file or a derivation of it.
const REMOVE_COPY: &str = "
DELETE {
  GRAPH {{graph}} {
    {{copy}} ?p ?o .
    ?s ?inbound {{copy}} .
  }
}
WHERE {
  GRAPH {{graph}} {
    {{piece}} prov:value {{source}} .
    FILTER({{resolved}} = {{source}} || EXISTS { {{resolved}} prov:hadPrimarySource {{source}} . })
    { {{copy}} ?p ?o . }
    UNION
    { ?s ?inbound {{copy}} . }
  }
}";

const REMOVE_COPY_WITH_FILE: &str = "
DELETE {
  GRAPH {{graph}} {
    {{copy}} ?p ?o .
    ?s ?inbound {{copy}} .
    {{file}} ?fileP ?fileO .
    ?physical ?physicalP ?physicalO .
  }
}
WHERE {
  GRAPH {{graph}} {
    {{piece}} prov:value {{source}} .
    FILTER({{resolved}} = {{source}} || EXISTS { {{resolved}} prov:hadPrimarySource {{source}} . })
    { {{copy}} ?p ?o . }
    UNION
    { ?s ?inbound {{copy}} . }
    UNION
    { {{file}} ?fileP ?fileO . }
    UNION
    {
      ?physical nie:dataSource {{file}} ;
        ?physicalP ?physicalO .
    }
  }
}";

const COPY_PRESENT: &str = "
ASK {
  GRAPH {{graph}} {
    { {{copy}} ?p ?o . }
    UNION
    { ?s ?inbound {{copy}} . }
  }
}";

const INSERT_FILE_PAIR: &str = "
INSERT DATA {
  GRAPH {{graph}} {
    {{virtual}} a nfo:FileDataObject ;
      mu:uuid {{virtualId}} ;
      nfo:fileName {{virtualName}} ;
      dct:format {{format}} ;
      nfo:fileSize {{size}} ;
      dbpedia:fileExtension {{extension}} ;
      dct:created {{created}} ;
      dct:modified {{created}} .
    {{physical}} a nfo:FileDataObject ;
      mu:uuid {{physicalId}} ;
      nfo:fileName {{physicalName}} ;
      dct:format {{format}} ;
      nfo:fileSize {{size}} ;
      dbpedia:fileExtension {{extension}} ;
      dct:created {{created}} ;
      dct:modified {{created}} ;
      nie:dataSource {{virtual}} .
  }
}";

/// The piece points at its file directly: the sanitized file takes its place.
const RELINK_VALUE: &str = "
DELETE {
  GRAPH {{graph}} {
    {{piece}} prov:value {{original}} .
  }
}
INSERT {
  GRAPH {{graph}} {
    {{piece}} prov:value {{sanitized}} .
    {{copy}} a dossier:Stuk ;
      mu:uuid {{copyId}} ;
      dct:title ?copyTitle ;
      dct:created {{now}} ;
      dct:modified {{now}} ;
      prov:value {{original}} ;
      besluitvorming:vertrouwelijkheidsniveau ?copyAccessLevel ;
      sign:ongetekendStuk {{piece}} .
  }
}
WHERE {
  GRAPH {{graph}} {
    {{piece}} a dossier:Stuk ;
      dct:title ?title ;
      prov:value {{original}} ;
      besluitvorming:vertrouwelijkheidsniveau ?accessLevel .
  }
  BIND({{copyTitle}} AS ?copyTitle)
  BIND({{promotion}} AS ?copyAccessLevel)
}";

/// The piece's file was replaced by a derivation: the sanitized file becomes
/// the derivation of record.
const RELINK_PRIMARY_SOURCE: &str = "
DELETE {
  GRAPH {{graph}} {
    {{original}} prov:hadPrimarySource {{source}} .
  }
}
INSERT {
  GRAPH {{graph}} {
    {{sanitized}} prov:hadPrimarySource {{source}} .
    {{copy}} a dossier:Stuk ;
      mu:uuid {{copyId}} ;
      dct:title ?copyTitle ;
      dct:created {{now}} ;
      dct:modified {{now}} ;
      prov:value {{original}} ;
      besluitvorming:vertrouwelijkheidsniveau ?copyAccessLevel ;
      sign:ongetekendStuk {{piece}} .
  }
}
WHERE {
  GRAPH {{graph}} {
    {{piece}} a dossier:Stuk ;
      dct:title ?title ;
      prov:value {{source}} ;
      besluitvorming:vertrouwelijkheidsniveau ?accessLevel .
    {{original}} prov:hadPrimarySource {{source}} .
  }
  BIND({{copyTitle}} AS ?copyTitle)
  BIND({{promotion}} AS ?copyAccessLevel)
}";

const COPY_EXISTS: &str = "
ASK {
  GRAPH {{graph}} {
    {{copy}} sign:ongetekendStuk {{piece}} .
  }
}";

fn with_prefixes(template: &str) -> String {
    format!("{}{}", PREFIXES, template)
}

/// Piece operations against one graph of a SPARQL endpoint.
pub struct SparqlPieceStore {
    graph: Arc<dyn GraphStore>,
    graph_uri: String,
}

impl SparqlPieceStore {
    pub fn new(graph: Arc<dyn GraphStore>, graph_uri: &str) -> Self {
        Self {
            graph,
            graph_uri: graph_uri.to_string(),
        }
    }

    fn statement(&self, template: &str) -> sparql::Statement {
        sparql::statement(with_prefixes(template)).bind_iri("graph", &self.graph_uri)
    }
}

fn piece_file_from(binding: &Binding) -> Result<PieceFile> {
    let uri = value(binding, "file")?.to_string();
    let source = value(binding, "source")?;
    let size = value(binding, "size")?;
    Ok(PieceFile {
        primary_source: (source != uri).then(|| source.to_string()),
        uri,
        id: value(binding, "id")?.to_string(),
        name: value(binding, "name")?.to_string(),
        format: value(binding, "format")?.to_string(),
        size: size
            .parse()
            .with_context(|| format!("file size '{}' is not a byte count", size))?,
        extension: value(binding, "extension")?.to_string(),
        physical_uri: value(binding, "physical")?.to_string(),
        access_level: optional_value(binding, "accessLevel").map(str::to_string),
    })
}

fn stale_copy_from(binding: &Binding) -> Result<StaleCopy> {
    let kind = match value(binding, "kind")? {
        "flattened" => StaleCopyKind::FlattenedCopy,
        _ => StaleCopyKind::SignedCopy,
    };
    Ok(StaleCopy {
        piece: value(binding, "copy")?.to_string(),
        file: optional_value(binding, "file").map(str::to_string),
        physical_uri: optional_value(binding, "physical").map(str::to_string),
        kind,
    })
}

fn bind_record(stmt: sparql::Statement, prefix: &str, record: &FileRecord) -> sparql::Statement {
    stmt.bind_iri(prefix, &record.uri)
        .bind_str(&format!("{}Id", prefix), &record.id)
        .bind_str(&format!("{}Name", prefix), &record.name)
}

#[async_trait]
impl PieceStore for SparqlPieceStore {
    async fn is_main_piece(&self, piece: &str) -> Result<bool> {
        let query = self
            .statement(IS_MAIN_PIECE)
            .bind_iri("piece", piece)
            .render()?;
        Ok(self.graph.query(&query).await?.is_true())
    }

    async fn piece_file(&self, piece: &str) -> Result<Option<PieceFile>> {
        let query = self
            .statement(PIECE_FILE)
            .bind_iri("piece", piece)
            .render()?;
        let response = self.graph.query(&query).await?;
        response
            .bindings()
            .first()
            .map(piece_file_from)
            .transpose()
            .with_context(|| format!("malformed file metadata for piece {}", piece))
    }

    async fn stale_copies(&self, piece: &str, current_file: &str) -> Result<Vec<StaleCopy>> {
        let query = self
            .statement(STALE_COPIES)
            .bind_iri("piece", piece)
            .bind_iri("current", current_file)
            .render()?;
        let response = self.graph.query(&query).await?;
        response.bindings().iter().map(stale_copy_from).collect()
    }

    async fn remove_copy(&self, piece: &str, resolved: &PieceFile, copy: &StaleCopy) -> Result<bool> {
        let stmt = match &copy.file {
            Some(file) => self
                .statement(REMOVE_COPY_WITH_FILE)
                .bind_iri("file", file),
            None => self.statement(REMOVE_COPY),
        };
        let update = stmt
            .bind_iri("copy", &copy.piece)
            .bind_iri("piece", piece)
            .bind_iri("source", resolved.bound_file())
            .bind_iri("resolved", &resolved.uri)
            .render()?;
        self.graph
            .update(&update)
            .await
            .with_context(|| format!("Failed to remove copy {}", copy.piece))?;

        let check = self
            .statement(COPY_PRESENT)
            .bind_iri("copy", &copy.piece)
            .render()?;
        Ok(!self.graph.query(&check).await?.is_true())
    }

    async fn insert_file_pair(&self, pair: &FilePair) -> Result<()> {
        let file = &pair.virtual_file;
        let size = i64::try_from(file.size).context("file size out of range")?;
        let stmt = self.statement(INSERT_FILE_PAIR);
        let stmt = bind_record(stmt, "virtual", &pair.virtual_file);
        let update = bind_record(stmt, "physical", &pair.physical_file)
            .bind_str("format", &file.format)
            .bind_int("size", size)
            .bind_str("extension", &file.extension)
            .bind_datetime("created", file.created)
            .render()?;
        self.graph
            .update(&update)
            .await
            .with_context(|| format!("Failed to insert file {}", file.uri))
    }

    async fn relink(&self, relink: &Relink<'_>) -> Result<bool> {
        let copy_title = Expr::concat(vec![Expr::var("title"), Expr::string(relink.title_suffix)]);
        let stmt = match &relink.original.primary_source {
            Some(source) => self
                .statement(RELINK_PRIMARY_SOURCE)
                .bind_iri("source", source),
            None => self.statement(RELINK_VALUE),
        };
        let update = stmt
            .bind_iri("piece", relink.piece)
            .bind_iri("original", &relink.original.uri)
            .bind_iri("sanitized", relink.sanitized_file)
            .bind_iri("copy", relink.copy_uri)
            .bind_str("copyId", relink.copy_id)
            .bind_datetime("now", relink.now)
            .bind_expr("copyTitle", copy_title)
            .bind_expr("promotion", relink.ladder.promotion_expr("accessLevel"))
            .render()?;
        self.graph
            .update(&update)
            .await
            .with_context(|| format!("Failed to relink piece {}", relink.piece))?;

        // An unmatched WHERE clause succeeds without writing anything.
        let check = self
            .statement(COPY_EXISTS)
            .bind_iri("copy", relink.copy_uri)
            .bind_iri("piece", relink.piece)
            .render()?;
        Ok(self.graph.query(&check).await?.is_true())
    }
}
