use std::collections::HashMap;

use wasmparser::types::Types;
use wasmparser::{
    Export, ExportSectionReader, ExternalKind, ImportSectionReader, Parser, Payload, TypeRef,
    ValType,
};

use crate::Engine;

/// Kind of a module-level import or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
    Tag,
}

/// Core signature of a function import or export.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) -> ({})", join(&self.params), join(&self.results))
    }
}

fn join(types: &[ValType]) -> String {
    types.iter().map(|t| val_type_name(*t)).collect::<Vec<_>>().join(", ")
}

pub(crate) fn val_type_name(ty: ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        ValType::Ref(_) => "ref",
    }
}

#[derive(Debug, Clone)]
pub struct ImportDecl {
    pub module: String,
    pub name: String,
    pub kind: ExternKind,
    /// Present for function imports.
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone)]
pub struct ExportDecl {
    pub name: String,
    pub kind: ExternKind,
    pub signature: Option<Signature>,
}

/// Import and export surface of a validated module.
#[derive(Debug, Clone, Default)]
pub struct ModuleAbi {
    pub imports: Vec<ImportDecl>,
    pub exports: HashMap<String, ExportDecl>,
}

impl ModuleAbi {
    pub fn export(&self, name: &str) -> Option<&ExportDecl> {
        self.exports.get(name)
    }

    pub fn has_export(&self, name: &str, kind: ExternKind) -> bool {
        self.exports.get(name).is_some_and(|e| e.kind == kind)
    }

    /// Imports declared under `module`.
    pub fn imports_from<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a ImportDecl> + 'a {
        self.imports.iter().filter(move |i| i.module == module)
    }
}

pub(crate) fn parse(engine: &Engine, bytes: &[u8]) -> Result<ModuleAbi, anyhow::Error> {
    let mut validator = engine.new_validator();
    let types = validator.validate_all(bytes)?;

    let mut builder = AbiBuilder::default();
    let parser = Parser::new(0);
    for payload in parser.parse_all(bytes) {
        builder.process_payload(payload?)?;
    }

    Ok(builder.build(&types))
}

#[derive(Default)]
struct AbiBuilder {
    /// `(module, name, type, function index)`
    imports: Vec<(String, String, TypeRef, Option<u32>)>,
    exports: Vec<(String, ExternKind, u32)>,
    imported_funcs: u32,
}

impl AbiBuilder {
    fn process_payload(&mut self, payload: Payload) -> Result<(), anyhow::Error> {
        match payload {
            Payload::ImportSection(reader) => self.parse_import_section(reader),
            Payload::ExportSection(reader) => self.parse_export_section(reader),
            _ => Ok(()),
        }
    }

    fn parse_import_section(&mut self, reader: ImportSectionReader) -> Result<(), anyhow::Error> {
        for import in reader {
            let import = import?;
            let func_idx = if let TypeRef::Func(_) = import.ty {
                let idx = self.imported_funcs;
                self.imported_funcs += 1;
                Some(idx)
            } else {
                None
            };
            self.imports.push((
                import.module.to_string(),
                import.name.to_string(),
                import.ty,
                func_idx,
            ));
        }
        Ok(())
    }

    fn parse_export_section(&mut self, reader: ExportSectionReader) -> Result<(), anyhow::Error> {
        for export in reader {
            self.parse_export(export?)?;
        }
        Ok(())
    }

    fn parse_export(&mut self, export: Export) -> Result<(), anyhow::Error> {
        let kind = match export.kind {
            ExternalKind::Func => ExternKind::Func,
            ExternalKind::Table => ExternKind::Table,
            ExternalKind::Memory => ExternKind::Memory,
            ExternalKind::Global => ExternKind::Global,
            ExternalKind::Tag => ExternKind::Tag,
        };
        self.exports.push((export.name.to_string(), kind, export.index));
        Ok(())
    }

    fn build(self, types: &Types) -> ModuleAbi {
        let imports = self
            .imports
            .into_iter()
            .map(|(module, name, ty, func_idx)| ImportDecl {
                module,
                name,
                kind: type_ref_kind(ty),
                signature: func_idx.map(|idx| func_signature(types, idx)),
            })
            .collect();

        let exports = self
            .exports
            .into_iter()
            .map(|(name, kind, index)| {
                let signature = (kind == ExternKind::Func).then(|| func_signature(types, index));
                (name.clone(), ExportDecl { name, kind, signature })
            })
            .collect();

        ModuleAbi { imports, exports }
    }
}

fn type_ref_kind(ty: TypeRef) -> ExternKind {
    match ty {
        TypeRef::Func(_) => ExternKind::Func,
        TypeRef::Table(_) => ExternKind::Table,
        TypeRef::Memory(_) => ExternKind::Memory,
        TypeRef::Global(_) => ExternKind::Global,
        TypeRef::Tag(_) => ExternKind::Tag,
    }
}

fn func_signature(types: &Types, func_idx: u32) -> Signature {
    let types = types.as_ref();
    let id = types.core_function_at(func_idx);
    let func = types[id].unwrap_func();
    Signature {
        params: func.params().to_vec(),
        results: func.results().to_vec(),
    }
}
