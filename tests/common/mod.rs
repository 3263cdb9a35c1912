// tests/common/mod.rs
//
// Shared catalog fixtures for the integration suites.

#![allow(dead_code)]

use depot::{CompositeKey, Entity, EntityKey, Navigation};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub pages: i32,
    pub rating: Option<f64>,
    pub price: Decimal,
}

impl Entity for Book {
    const SET: &'static str = "books";
    type Key = i64;

    fn key(&self) -> i64 {
        self.id
    }
}

pub fn book(id: i64, title: &str, pages: i32, rating: Option<f64>, price: &str) -> Book {
    Book {
        id,
        title: title.to_string(),
        pages,
        rating,
        price: Decimal::from_str(price).expect("fixture price"),
    }
}

/// A loan is keyed by (book id, member name) and points back at its book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub book_id: i64,
    pub member: String,
    pub days: i32,
}

impl Entity for Loan {
    const SET: &'static str = "loans";
    type Key = (i64, String);

    fn key(&self) -> (i64, String) {
        (self.book_id, self.member.clone())
    }

    fn navigations() -> &'static [Navigation<Self>] {
        static NAVS: [Navigation<Loan>; 1] = [Navigation {
            name: "book",
            target_set: "books",
            key_of: loan_book_key,
        }];
        &NAVS
    }
}

fn loan_book_key(loan: &Loan) -> Option<CompositeKey> {
    Some(loan.book_id.encode())
}

pub fn loan(book_id: i64, member: &str, days: i32) -> Loan {
    Loan {
        book_id,
        member: member.to_string(),
        days,
    }
}
