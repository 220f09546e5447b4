//! Removal of signature form fields from PDF documents.
//!
//! The interactive form of a PDF is a tree of fields rooted at the
//! catalog's `/AcroForm /Fields`. Each terminal field has a type (`/FT`,
//! possibly inherited from an ancestor) and one or more widget annotations
//! placed on pages. Removing a signature field means unlinking it from its
//! parent, dropping its widgets from every page's `/Annots`, and deleting
//! the objects. Other fields are left untouched.

use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StripError {
    #[error("not a readable PDF: {0}")]
    Parse(#[source] lopdf::Error),
    #[error("PDF form structure is malformed: {0}")]
    Structure(#[source] lopdf::Error),
    #[error("failed to write PDF: {0}")]
    Save(#[source] std::io::Error),
}

/// Result of a strip attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stripped {
    /// At least one signature field was removed; these are the new bytes.
    Sanitized(Vec<u8>),
    /// The document carries no signature fields.
    NoSignatures,
}

/// Transforms document bytes into signature-free bytes.
pub trait SignatureStripper: Send + Sync {
    fn strip(&self, pdf: &[u8]) -> Result<Stripped, StripError>;
}

/// Field type as declared by `/FT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Button,
    Text,
    Choice,
    Signature,
    Unknown(Option<String>),
}

impl FieldKind {
    pub fn from_field_type(ft: Option<&[u8]>) -> Self {
        match ft {
            Some(b"Btn") => FieldKind::Button,
            Some(b"Tx") => FieldKind::Text,
            Some(b"Ch") => FieldKind::Choice,
            Some(b"Sig") => FieldKind::Signature,
            Some(other) => FieldKind::Unknown(Some(String::from_utf8_lossy(other).into_owned())),
            None => FieldKind::Unknown(None),
        }
    }

    pub fn is_signature(&self) -> bool {
        matches!(self, FieldKind::Signature)
    }
}

/// Where a field is referenced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldParent {
    /// The `/Fields` array of the AcroForm.
    Root,
    /// The `/Kids` array of a non-terminal field.
    Field(ObjectId),
}

/// A terminal form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub id: ObjectId,
    /// Partial name (`/T`).
    pub name: Option<String>,
    pub kind: FieldKind,
    pub parent: FieldParent,
    /// Widget annotations of this field; includes `id` itself when the
    /// field and its widget share a dictionary.
    pub widgets: Vec<ObjectId>,
}

/// Location of a dictionary inside the document.
#[derive(Debug, Clone, Copy)]
enum DictLoc {
    Object(ObjectId),
    /// Dictionary stored inline under `key` of the object `id`.
    Inline(ObjectId, &'static [u8]),
}

fn dict_at(doc: &Document, loc: DictLoc) -> lopdf::Result<&Dictionary> {
    match loc {
        DictLoc::Object(id) => doc.get_object(id)?.as_dict(),
        DictLoc::Inline(id, key) => doc.get_object(id)?.as_dict()?.get(key)?.as_dict(),
    }
}

fn dict_at_mut(doc: &mut Document, loc: DictLoc) -> lopdf::Result<&mut Dictionary> {
    match loc {
        DictLoc::Object(id) => doc.get_object_mut(id)?.as_dict_mut(),
        DictLoc::Inline(id, key) => doc
            .get_object_mut(id)?
            .as_dict_mut()?
            .get_mut(key)?
            .as_dict_mut(),
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> lopdf::Result<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id),
        other => Ok(other),
    }
}

/// The AcroForm dictionary, if the document has one.
fn acroform_loc(doc: &Document) -> lopdf::Result<Option<DictLoc>> {
    let root_id = doc.trailer.get(b"Root")?.as_reference()?;
    let catalog = doc.get_object(root_id)?.as_dict()?;
    Ok(match catalog.get(b"AcroForm") {
        Ok(Object::Reference(id)) => Some(DictLoc::Object(*id)),
        Ok(Object::Dictionary(_)) => Some(DictLoc::Inline(root_id, b"AcroForm")),
        _ => None,
    })
}

/// Array stored under `key` in `dict`, following one level of indirection.
fn array_entries(doc: &Document, dict: &Dictionary, key: &[u8]) -> lopdf::Result<Vec<Object>> {
    match dict.get(key) {
        Ok(obj) => Ok(resolve(doc, obj)?.as_array()?.clone()),
        Err(_) => Ok(Vec::new()),
    }
}

fn name_of(dict: &Dictionary) -> Option<String> {
    match dict.get(b"T") {
        Ok(Object::String(bytes, _)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

fn is_widget(dict: &Dictionary) -> bool {
    matches!(dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"Widget")
}

struct Walker<'a> {
    doc: &'a Document,
    visited: BTreeSet<ObjectId>,
    fields: Vec<FormField>,
}

impl<'a> Walker<'a> {
    fn walk(
        &mut self,
        entries: &[Object],
        parent: FieldParent,
        inherited_ft: Option<&'a [u8]>,
    ) -> lopdf::Result<()> {
        let doc = self.doc;
        for entry in entries {
            // Fields referenced from /Annots are always indirect objects.
            let Object::Reference(id) = entry else {
                continue;
            };
            if !self.visited.insert(*id) {
                continue;
            }
            let dict = doc.get_object(*id)?.as_dict()?;
            let ft = match dict.get(b"FT") {
                Ok(obj) => Some(obj.as_name()?),
                Err(_) => inherited_ft,
            };

            let mut child_fields = Vec::new();
            let mut widgets = Vec::new();
            for kid in array_entries(doc, dict, b"Kids")? {
                let Object::Reference(kid_id) = kid else {
                    continue;
                };
                if doc.get_object(kid_id)?.as_dict()?.has(b"T") {
                    child_fields.push(kid);
                } else {
                    widgets.push(kid_id);
                }
            }

            if !child_fields.is_empty() {
                self.walk(&child_fields, FieldParent::Field(*id), ft)?;
                continue;
            }

            if is_widget(dict) {
                widgets.insert(0, *id);
            }
            self.fields.push(FormField {
                id: *id,
                name: name_of(dict),
                kind: FieldKind::from_field_type(ft),
                parent,
                widgets,
            });
        }
        Ok(())
    }
}

/// All terminal form fields of a loaded document.
pub fn collect_fields(doc: &Document) -> lopdf::Result<Vec<FormField>> {
    let Some(loc) = acroform_loc(doc)? else {
        return Ok(Vec::new());
    };
    let acroform = dict_at(doc, loc)?;
    let roots = array_entries(doc, acroform, b"Fields")?;

    let mut walker = Walker {
        doc,
        visited: BTreeSet::new(),
        fields: Vec::new(),
    };
    walker.walk(&roots, FieldParent::Root, None)?;
    Ok(walker.fields)
}

/// Parse `pdf` and list its terminal form fields.
pub fn form_fields(pdf: &[u8]) -> Result<Vec<FormField>, StripError> {
    let doc = Document::load_mem(pdf).map_err(StripError::Parse)?;
    collect_fields(&doc).map_err(StripError::Structure)
}

/// Drop references to any object in `drop` from the array under `key`.
fn retain_refs(
    doc: &mut Document,
    loc: DictLoc,
    key: &[u8],
    drop: &BTreeSet<ObjectId>,
) -> lopdf::Result<()> {
    let indirect = match dict_at_mut(doc, loc)?.get(key) {
        Ok(Object::Reference(id)) => Some(*id),
        Ok(Object::Array(_)) => None,
        _ => return Ok(()),
    };
    let array = match indirect {
        Some(id) => doc.get_object_mut(id)?.as_array_mut()?,
        None => dict_at_mut(doc, loc)?.get_mut(key)?.as_array_mut()?,
    };
    array.retain(|obj| !matches!(obj, Object::Reference(id) if drop.contains(id)));
    Ok(())
}

/// Remove every signature field from `doc`. Returns the removed fields.
pub fn remove_signature_fields(doc: &mut Document) -> lopdf::Result<Vec<FormField>> {
    let Some(acroform) = acroform_loc(doc)? else {
        return Ok(Vec::new());
    };
    let signatures: Vec<FormField> = collect_fields(doc)?
        .into_iter()
        .filter(|f| f.kind.is_signature())
        .collect();
    if signatures.is_empty() {
        return Ok(signatures);
    }

    let mut drop = BTreeSet::new();
    for field in &signatures {
        drop.insert(field.id);
        drop.extend(field.widgets.iter().copied());
    }

    let mut parents = Vec::new();
    for field in &signatures {
        match field.parent {
            FieldParent::Root => retain_refs(doc, acroform, b"Fields", &drop)?,
            FieldParent::Field(parent) => {
                retain_refs(doc, DictLoc::Object(parent), b"Kids", &drop)?;
                parents.push(parent);
            }
        }
    }

    // A non-terminal field left without kids would read as a terminal
    // field of the inherited type, so it goes too.
    while let Some(parent) = parents.pop() {
        if drop.contains(&parent) {
            continue;
        }
        let dict = doc.get_object(parent)?.as_dict()?;
        if !array_entries(doc, dict, b"Kids")?.is_empty() {
            continue;
        }
        let grandparent = match dict.get(b"Parent") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
        };
        drop.insert(parent);
        match grandparent {
            Some(gp) => {
                retain_refs(doc, DictLoc::Object(gp), b"Kids", &drop)?;
                parents.push(gp);
            }
            None => retain_refs(doc, acroform, b"Fields", &drop)?,
        }
    }

    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for page in pages {
        retain_refs(doc, DictLoc::Object(page), b"Annots", &drop)?;
    }

    for id in &drop {
        doc.objects.remove(id);
    }

    // Without signature fields the form no longer declares signatures.
    dict_at_mut(doc, acroform)?.remove(b"SigFlags");

    Ok(signatures)
}

/// [`SignatureStripper`] over `lopdf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfSignatureStripper;

impl SignatureStripper for PdfSignatureStripper {
    fn strip(&self, pdf: &[u8]) -> Result<Stripped, StripError> {
        let mut doc = Document::load_mem(pdf).map_err(StripError::Parse)?;
        let removed = remove_signature_fields(&mut doc).map_err(StripError::Structure)?;
        if removed.is_empty() {
            return Ok(Stripped::NoSignatures);
        }

        for field in &removed {
            tracing::debug!(
                field = field.name.as_deref().unwrap_or("<unnamed>"),
                "removed signature field"
            );
        }

        let mut out = Vec::with_capacity(pdf.len());
        doc.save_to(&mut out).map_err(StripError::Save)?;
        Ok(Stripped::Sanitized(out))
    }
}
