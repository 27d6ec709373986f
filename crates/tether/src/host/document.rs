//! A tiny element tree standing in for a document.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::{expect_string, not_a};
use crate::error::HostError;
use crate::linker::{Capability, Linker, Param, Ret};
use crate::value::{HostObject, HostValue};

#[derive(Debug)]
pub struct Element {
    tag: String,
    id: RefCell<String>,
    text: RefCell<String>,
    children: RefCell<Vec<Rc<Element>>>,
    parent: RefCell<Weak<Element>>,
}

impl HostObject for Element {
    fn class_name(&self) -> &str {
        "HTMLElement"
    }
}

impl Element {
    pub fn new(tag: &str) -> Rc<Self> {
        Rc::new(Self {
            tag: tag.to_ascii_uppercase(),
            id: RefCell::default(),
            text: RefCell::default(),
            children: RefCell::default(),
            parent: RefCell::default(),
        })
    }

    pub fn tag_name(&self) -> &str {
        &self.tag
    }

    pub fn id(&self) -> String {
        self.id.borrow().clone()
    }

    pub fn children(&self) -> Vec<Rc<Element>> {
        self.children.borrow().clone()
    }

    pub fn parent(&self) -> Option<Rc<Element>> {
        self.parent.borrow().upgrade()
    }

    /// Own text followed by the text of every descendant, in tree order.
    pub fn text_content(&self) -> String {
        let mut out = self.text.borrow().clone();
        for child in self.children.borrow().iter() {
            out.push_str(&child.text_content());
        }
        out
    }

    /// Replace all content with a single run of text.
    pub fn set_text_content(&self, text: &str) {
        for child in self.children.take() {
            *child.parent.borrow_mut() = Weak::new();
        }
        *self.text.borrow_mut() = text.to_string();
    }

    fn is_inclusive_ancestor_of(self: &Rc<Self>, node: &Rc<Element>) -> bool {
        let mut cursor = Some(Rc::clone(node));
        while let Some(n) = cursor {
            if Rc::ptr_eq(&n, self) {
                return true;
            }
            cursor = n.parent();
        }
        false
    }

    /// Move `child` under `self`, detaching it from any previous parent.
    pub fn append_child(self: &Rc<Self>, child: &Rc<Element>) -> Result<(), HostError> {
        if child.is_inclusive_ancestor_of(self) {
            return Err(HostError::new(
                "HierarchyRequestError",
                "The new child element contains the parent.",
            ));
        }
        if let Some(old) = child.parent() {
            old.children.borrow_mut().retain(|c| !Rc::ptr_eq(c, child));
        }
        *child.parent.borrow_mut() = Rc::downgrade(self);
        self.children.borrow_mut().push(Rc::clone(child));
        Ok(())
    }

    fn find_by_id(self: &Rc<Self>, id: &str) -> Option<Rc<Element>> {
        if *self.id.borrow() == id {
            return Some(Rc::clone(self));
        }
        self.children
            .borrow()
            .iter()
            .find_map(|child| child.find_by_id(id))
    }
}

/// Document state shared by the `document_*` capabilities.
#[derive(Debug)]
pub struct Document {
    pub body: Rc<Element>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            body: Element::new("body"),
        }
    }
}

impl Document {
    /// Connected element with the given id. Detached elements are not found.
    pub fn get_element_by_id(&self, id: &str) -> Option<Rc<Element>> {
        if id.is_empty() {
            return None;
        }
        self.body.find_by_id(id)
    }
}

fn valid_tag_name(tag: &str) -> bool {
    let mut chars = tag.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn element(value: &HostValue) -> Result<Rc<Element>, HostError> {
    value.downcast::<Element>().ok_or_else(|| not_a(value, "an element"))
}

pub(super) fn register(linker: &mut Linker) {
    linker.define(Capability::new("document_body", &[], Ret::Handle, |cx, _| {
        let doc = cx.extensions.get_or_insert_with(Document::default);
        Ok(HostValue::Object(doc.body.clone()))
    }));
    linker.define(
        Capability::new("document_create_element", &[Param::Str], Ret::Handle, |_, args| {
            let tag = expect_string(&args[0]);
            if !valid_tag_name(tag) {
                return Err(HostError::new(
                    "InvalidCharacterError",
                    format!("The tag name provided ('{tag}') is not a valid name."),
                ));
            }
            Ok(HostValue::Object(Element::new(tag)))
        })
        .fallible(),
    );
    linker.define(Capability::new(
        "document_get_element_by_id",
        &[Param::Str],
        Ret::OptionalHandle,
        |cx, args| {
            let doc = cx.extensions.get_or_insert_with(Document::default);
            Ok(match doc.get_element_by_id(expect_string(&args[0])) {
                Some(el) => HostValue::Object(el),
                None => HostValue::Null,
            })
        },
    ));
    linker.define(Capability::new(
        "element_set_id",
        &[Param::Handle, Param::Str],
        Ret::Unit,
        |_, args| {
            *element(&args[0])?.id.borrow_mut() = expect_string(&args[1]).to_string();
            Ok(HostValue::Undefined)
        },
    ));
    linker.define(Capability::new(
        "element_set_text_content",
        &[Param::Handle, Param::Str],
        Ret::Unit,
        |_, args| {
            element(&args[0])?.set_text_content(expect_string(&args[1]));
            Ok(HostValue::Undefined)
        },
    ));
    linker.define(Capability::new("element_text_content", &[Param::Handle], Ret::Str, |_, args| {
        Ok(HostValue::from(element(&args[0])?.text_content()))
    }));
    linker.define(
        Capability::new(
            "element_append_child",
            &[Param::Handle, Param::Handle],
            Ret::Handle,
            |_, args| {
                let parent = element(&args[0])?;
                let child = element(&args[1])?;
                parent.append_child(&child)?;
                Ok(HostValue::Object(child))
            },
        )
        .fallible(),
    );
    linker.define(Capability::new("element_child_count", &[Param::Handle], Ret::I32, |_, args| {
        Ok(HostValue::Number(element(&args[0])?.children.borrow().len() as f64))
    }));
    linker.define(Capability::new("element_tag_name", &[Param::Handle], Ret::Str, |_, args| {
        Ok(HostValue::from(element(&args[0])?.tag_name()))
    }));
}
